//! Streaming relay engine
//!
//! Byte-transparent forwarding of upstream SSE to the client with
//! out-of-band usage capture. The relay task owns the upstream body and
//! feeds processed event blocks into a bounded channel that backs the
//! client response; dropping the client side of the channel cancels the
//! upstream read.
//!
//! Guarantees:
//! - within one stream, bytes reach the client in upstream order;
//! - the client always observes a terminating `[DONE]` or a natural
//!   upstream close; mid-stream failures are coerced into a synthetic
//!   error event followed by `[DONE]`;
//! - usage is reported at most once per request, and only when usage
//!   metadata was actually observed.

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::usage::UsageDelta;

use super::client::{data_payload, event_name, drain_sse_events, is_sse_done};

const HEARTBEAT_GAP: Duration = Duration::from_secs(15);
const CHANNEL_DEPTH: usize = 32;

/// How usage metadata is located in the stream, per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStyle {
    /// `usageMetadata` at the top level or under `.response`. When
    /// `unwrap_envelope` is set, Cloud-Code `{response:{…}}` envelopes are
    /// unwrapped so clients see standard Gemini events.
    Gemini { unwrap_envelope: bool },
    /// `message_start` carries input/cache counts, `message_delta` the
    /// cumulative output count.
    Anthropic,
    /// `event: response.completed` carries `response.usage`.
    OpenaiResponses,
    /// Final chunk carries `.usage`.
    OpenaiChat,
}

#[derive(Debug, Default)]
pub struct UsageAccumulator {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_create_tokens: i64,
    pub cache_read_tokens: i64,
    pub total_token_count: i64,
    observed: bool,
}

impl UsageAccumulator {
    /// Inspect one parsed SSE event for usage metadata.
    pub fn observe(&mut self, style: UsageStyle, event: Option<&str>, json: &Value) {
        match style {
            UsageStyle::Gemini { .. } => {
                let metadata = json
                    .get("usageMetadata")
                    .or_else(|| json.pointer("/response/usageMetadata"));
                if let Some(metadata) = metadata {
                    let prompt = int(metadata, "promptTokenCount");
                    let candidates = int(metadata, "candidatesTokenCount");
                    let cached = int(metadata, "cachedContentTokenCount");
                    self.input_tokens = (prompt - cached).max(0);
                    self.cache_read_tokens = cached;
                    self.output_tokens = candidates;
                    self.total_token_count = match metadata.get("totalTokenCount") {
                        Some(total) => total.as_i64().unwrap_or(prompt + candidates),
                        None => prompt + candidates,
                    };
                    self.observed = true;
                }
            }
            UsageStyle::Anthropic => {
                if let Some(usage) = json.pointer("/message/usage") {
                    self.input_tokens = int(usage, "input_tokens");
                    self.cache_create_tokens = int(usage, "cache_creation_input_tokens");
                    self.cache_read_tokens = int(usage, "cache_read_input_tokens");
                    self.observed = true;
                }
                if json.get("type").and_then(|v| v.as_str()) == Some("message_delta") {
                    if let Some(usage) = json.get("usage") {
                        // Cumulative, not incremental.
                        let output = int(usage, "output_tokens");
                        if output > 0 {
                            self.output_tokens = output;
                            self.observed = true;
                        }
                    }
                }
                self.total_token_count = self.input_tokens
                    + self.output_tokens
                    + self.cache_create_tokens
                    + self.cache_read_tokens;
            }
            UsageStyle::OpenaiResponses => {
                if event == Some("response.completed") {
                    if let Some(usage) = json.pointer("/response/usage") {
                        let input = int(usage, "input_tokens");
                        let cached = usage
                            .pointer("/input_tokens_details/cached_tokens")
                            .and_then(|v| v.as_i64())
                            .unwrap_or(0);
                        // Billable input never goes negative.
                        self.input_tokens = (input - cached).max(0);
                        self.cache_read_tokens = cached;
                        self.output_tokens = int(usage, "output_tokens");
                        self.total_token_count = input + self.output_tokens;
                        self.observed = true;
                    }
                }
            }
            UsageStyle::OpenaiChat => {
                if let Some(usage) = json.get("usage").filter(|u| u.is_object()) {
                    let prompt = int(usage, "prompt_tokens");
                    let cached = usage
                        .pointer("/prompt_tokens_details/cached_tokens")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    self.input_tokens = (prompt - cached).max(0);
                    self.cache_read_tokens = cached;
                    self.output_tokens = int(usage, "completion_tokens");
                    self.total_token_count = prompt + self.output_tokens;
                    self.observed = true;
                }
            }
        }
    }

    /// The delta to record, or `None` when no usage was observed or the
    /// total was zero.
    pub fn finalize(&self) -> Option<UsageDelta> {
        if !self.observed || self.total_token_count <= 0 {
            return None;
        }
        Some(UsageDelta {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_create_tokens: self.cache_create_tokens,
            cache_read_tokens: self.cache_read_tokens,
        })
    }
}

fn int(value: &Value, field: &str) -> i64 {
    value.get(field).and_then(|v| v.as_i64()).unwrap_or(0)
}

/// Process one complete event block: capture usage, optionally unwrap the
/// Cloud-Code envelope, and produce the bytes forwarded to the client.
pub fn process_event_block(block: &str, style: UsageStyle, acc: &mut UsageAccumulator) -> Bytes {
    let Some(payload) = data_payload(block) else {
        // Comment/heartbeat blocks pass through untouched.
        return Bytes::from(format!("{}\n\n", block));
    };

    if is_sse_done(&payload) {
        return Bytes::from(format!("data: {}\n\n", payload));
    }

    let Ok(json) = serde_json::from_str::<Value>(&payload) else {
        return Bytes::from(format!("data: {}\n\n", payload));
    };

    acc.observe(style, event_name(block), &json);

    if let UsageStyle::Gemini {
        unwrap_envelope: true,
    } = style
    {
        if let Some(inner) = json.get("response").filter(|v| v.is_object()) {
            return Bytes::from(format!("data: {}\n\n", inner));
        }
    }

    Bytes::from(format!("{}\n\n", block))
}

/// Synthetic close for failures after the headers were flushed, so clients
/// see a clean `[DONE]` instead of a premature close.
pub fn synthetic_error_block(message: &str) -> Bytes {
    let error = serde_json::json!({
        "error": {
            "message": message,
            "type": "stream_error",
        }
    });
    Bytes::from(format!("data: {}\n\ndata: [DONE]\n\n", error))
}

/// Relay an upstream SSE response to the client.
///
/// `on_usage` fires at most once, after the stream ends, iff usage
/// metadata with a positive total was observed.
pub fn relay_sse(
    upstream: reqwest::Response,
    style: UsageStyle,
    on_usage: impl FnOnce(UsageDelta) + Send + 'static,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_DEPTH);
    tokio::spawn(run_relay(upstream, style, on_usage, tx));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn run_relay(
    upstream: reqwest::Response,
    style: UsageStyle,
    on_usage: impl FnOnce(UsageDelta) + Send + 'static,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut stream = upstream.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut acc = UsageAccumulator::default();
    let mut last_activity = tokio::time::Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_GAP);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    heartbeat.tick().await;

    'relay: loop {
        tokio::select! {
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        last_activity = tokio::time::Instant::now();
                        for block in drain_sse_events(&mut buffer, &bytes) {
                            let out = process_event_block(&block, style, &mut acc);
                            if tx.send(Ok(out)).await.is_err() {
                                // Client went away; stop reading upstream.
                                break 'relay;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        crate::logger::error(
                            "relay",
                            &format!("Upstream stream error: {}", e),
                        );
                        let _ = tx.send(Ok(synthetic_error_block(&e.to_string()))).await;
                        break 'relay;
                    }
                    None => {
                        // Upstream closed; flush any partial tail untouched.
                        if !buffer.is_empty() {
                            let tail = std::mem::take(&mut buffer);
                            let _ = tx.send(Ok(Bytes::from(tail))).await;
                        }
                        break 'relay;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() >= HEARTBEAT_GAP {
                    if tx.send(Ok(Bytes::from_static(b"\n"))).await.is_err() {
                        break 'relay;
                    }
                }
            }
        }
    }

    match acc.finalize() {
        Some(delta) => on_usage(delta),
        None => crate::logger::warn(
            "relay",
            "Stream ended without usable usage metadata; no counters recorded",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gemini() -> UsageStyle {
        UsageStyle::Gemini {
            unwrap_envelope: false,
        }
    }

    #[test]
    fn passthrough_preserves_event_blocks() {
        let mut acc = UsageAccumulator::default();
        let block = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\"}";
        let out = process_event_block(block, UsageStyle::Anthropic, &mut acc);
        assert_eq!(out, Bytes::from(format!("{}\n\n", block)));
    }

    #[test]
    fn done_and_non_json_payloads_forwarded_as_data() {
        let mut acc = UsageAccumulator::default();
        let out = process_event_block("data: [DONE]", gemini(), &mut acc);
        assert_eq!(out, Bytes::from("data: [DONE]\n\n"));
        let out = process_event_block("data: not json", gemini(), &mut acc);
        assert_eq!(out, Bytes::from("data: not json\n\n"));
    }

    #[test]
    fn gemini_usage_capture_with_cached_tokens() {
        let mut acc = UsageAccumulator::default();
        let block = r#"data: {"candidates":[],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5,"cachedContentTokenCount":4,"totalTokenCount":15}}"#;
        process_event_block(block, gemini(), &mut acc);
        let delta = acc.finalize().unwrap();
        assert_eq!(delta.input_tokens, 6);
        assert_eq!(delta.cache_read_tokens, 4);
        assert_eq!(delta.output_tokens, 5);
        assert_eq!(acc.total_token_count, 15);
    }

    #[test]
    fn cloud_code_envelope_unwrapped_only_when_requested() {
        let style = UsageStyle::Gemini {
            unwrap_envelope: true,
        };
        let mut acc = UsageAccumulator::default();
        let block = r#"data: {"response":{"candidates":[{"content":{}}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":5,"totalTokenCount":8}}}"#;
        let out = process_event_block(block, style, &mut acc);
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(!text.contains("\"response\""));
        assert!(text.contains("\"candidates\""));
        // Usage was captured from inside the envelope.
        assert_eq!(acc.total_token_count, 8);

        // Without unwrapping, bytes pass through unchanged.
        let mut acc2 = UsageAccumulator::default();
        let out2 = process_event_block(block, gemini(), &mut acc2);
        assert_eq!(out2, Bytes::from(format!("{}\n\n", block)));
        assert_eq!(acc2.total_token_count, 8);
    }

    #[test]
    fn anthropic_usage_accumulates_across_events() {
        let mut acc = UsageAccumulator::default();
        let start = r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"cache_creation_input_tokens":3,"cache_read_input_tokens":2}}}"#;
        acc.observe(
            UsageStyle::Anthropic,
            Some("message_start"),
            &serde_json::from_str(start).unwrap(),
        );
        let delta1 = r#"{"type":"message_delta","usage":{"output_tokens":4}}"#;
        acc.observe(
            UsageStyle::Anthropic,
            Some("message_delta"),
            &serde_json::from_str(delta1).unwrap(),
        );
        let delta2 = r#"{"type":"message_delta","usage":{"output_tokens":9}}"#;
        acc.observe(
            UsageStyle::Anthropic,
            Some("message_delta"),
            &serde_json::from_str(delta2).unwrap(),
        );
        let delta = acc.finalize().unwrap();
        assert_eq!(delta.input_tokens, 12);
        assert_eq!(delta.output_tokens, 9);
        assert_eq!(delta.cache_create_tokens, 3);
        assert_eq!(delta.cache_read_tokens, 2);
    }

    #[test]
    fn responses_billable_input_never_negative() {
        let mut acc = UsageAccumulator::default();
        let json = serde_json::json!({
            "response": {"usage": {
                "input_tokens": 5,
                "output_tokens": 2,
                "input_tokens_details": {"cached_tokens": 9}
            }}
        });
        acc.observe(UsageStyle::OpenaiResponses, Some("response.completed"), &json);
        let delta = acc.finalize().unwrap();
        assert_eq!(delta.input_tokens, 0);
        assert_eq!(delta.cache_read_tokens, 9);
    }

    #[test]
    fn responses_usage_requires_completed_event() {
        let mut acc = UsageAccumulator::default();
        let json = serde_json::json!({
            "response": {"usage": {"input_tokens": 5, "output_tokens": 2}}
        });
        acc.observe(UsageStyle::OpenaiResponses, Some("response.delta"), &json);
        assert!(acc.finalize().is_none());
    }

    #[test]
    fn no_usage_means_no_report() {
        let acc = UsageAccumulator::default();
        assert!(acc.finalize().is_none());

        let mut zero = UsageAccumulator::default();
        zero.observe(
            gemini(),
            None,
            &serde_json::json!({"usageMetadata": {"promptTokenCount": 0, "candidatesTokenCount": 0, "totalTokenCount": 0}}),
        );
        assert!(zero.finalize().is_none());
    }

    #[test]
    fn synthetic_close_carries_error_then_done() {
        let bytes = synthetic_error_block("connection reset");
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let mut blocks = text.split("\n\n").filter(|b| !b.is_empty());
        let first = blocks.next().unwrap();
        assert!(first.starts_with("data: "));
        let json: Value =
            serde_json::from_str(first.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(json["error"]["type"], "stream_error");
        assert_eq!(blocks.next().unwrap(), "data: [DONE]");
    }
}
