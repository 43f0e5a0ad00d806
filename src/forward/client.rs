//! HTTP transport for upstream dispatch
//!
//! Builds reqwest clients with per-account proxy configuration
//! (http/https/socks5, falling back to a direct connection) and carries
//! the SSE parsing helpers shared by the relay and the dialect handlers.

use std::time::Duration;

use reqwest::{header::HeaderMap, Client, Proxy};
use serde_json::Value;

use crate::accounts::record::ProxyConfig;
use crate::config;

use super::error::{ForwardError, ForwardResult};

fn proxy_url(cfg: &ProxyConfig) -> String {
    let url = cfg.url.trim();
    if url.contains("://") {
        return url.to_string();
    }
    let scheme = match cfg.proxy_type.as_str() {
        "socks5" => "socks5",
        "https" => "https",
        _ => "http",
    };
    format!("{}://{}", scheme, url)
}

fn build_proxy(cfg: &ProxyConfig) -> Option<Proxy> {
    if cfg.url.trim().is_empty() {
        return None;
    }
    let mut proxy = match Proxy::all(proxy_url(cfg)) {
        Ok(proxy) => proxy,
        Err(_) => {
            crate::logger::warn(
                "client",
                "Failed to parse account proxy URL, using direct connection",
            );
            return None;
        }
    };
    if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
        proxy = proxy.basic_auth(username, password);
    }
    Some(proxy)
}

/// Build an HTTP client honoring the account's proxy, if any.
pub fn build_client(proxy: Option<&ProxyConfig>, timeout_secs: u64) -> ForwardResult<Client> {
    let cfg = config::load();
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs));

    if let Some(proxy_cfg) = proxy {
        if let Some(proxy) = build_proxy(proxy_cfg) {
            builder = builder.proxy(proxy);
        }
    }

    builder
        .build()
        .map_err(|e| ForwardError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Client for non-streaming upstream calls.
pub fn default_client(proxy: Option<&ProxyConfig>) -> ForwardResult<Client> {
    build_client(proxy, 120)
}

/// Client for streaming upstream calls; long timeout from config.
pub fn streaming_client(proxy: Option<&ProxyConfig>) -> ForwardResult<Client> {
    build_client(proxy, config::load().request_timeout_secs)
}

/// POST a JSON body. Transport failures map to the gateway error taxonomy
/// (timeouts become 504, everything else an internal api_error).
pub async fn post_json(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
) -> ForwardResult<reqwest::Response> {
    client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            crate::logger::error("client", &format!("Upstream request failed: {}", e));
            if e.is_timeout() {
                ForwardError::Timeout("Upstream request timed out".to_string())
            } else {
                ForwardError::Internal(format!("Upstream request failed: {}", e))
            }
        })
}

pub async fn get_url(
    client: &Client,
    url: &str,
    headers: HeaderMap,
) -> ForwardResult<reqwest::Response> {
    client.get(url).headers(headers).send().await.map_err(|e| {
        if e.is_timeout() {
            ForwardError::Timeout("Upstream request timed out".to_string())
        } else {
            ForwardError::Internal(format!("Upstream request failed: {}", e))
        }
    })
}

// ----------------------------------------------------------------------
// SSE parsing
// ----------------------------------------------------------------------

/// Parse an SSE `data:` line, stripping the optional leading space.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Check if an SSE data payload is the stream terminator.
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drain complete SSE event blocks from a byte buffer. Blocks are
/// separated by a blank line (`\n\n` or `\r\n\r\n`); a trailing partial
/// event stays buffered for the next chunk.
pub fn drain_sse_events(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut events = Vec::new();
    loop {
        let Some((end, sep_len)) = find_event_boundary(buffer) else {
            break;
        };
        let raw: Vec<u8> = buffer.drain(..end + sep_len).collect();
        let mut event = &raw[..end];
        if event.last() == Some(&b'\r') {
            event = &event[..event.len() - 1];
        }
        events.push(String::from_utf8_lossy(event).to_string());
    }
    events
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == b'\n' {
            if buffer[i + 1] == b'\n' {
                return Some((i, 2));
            }
            if i + 2 < buffer.len() && buffer[i + 1] == b'\r' && buffer[i + 2] == b'\n' {
                return Some((i, 3));
            }
        }
        i += 1;
    }
    None
}

/// The `event:` name of a block, if present.
pub fn event_name(block: &str) -> Option<&str> {
    block.lines().find_map(|line| {
        line.strip_prefix("event:")
            .map(|rest| rest.strip_prefix(' ').unwrap_or(rest).trim_end())
    })
}

/// Concatenated `data:` payload of a block; `None` when the block has no
/// data lines at all.
pub fn data_payload(block: &str) -> Option<String> {
    let mut payload: Option<String> = None;
    for line in block.lines() {
        if let Some(data) = parse_sse_data(line) {
            match payload.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(data);
                }
                None => payload = Some(data.to_string()),
            }
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_data() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data("event: message"), None);
        assert_eq!(parse_sse_data("hello"), None);
    }

    #[test]
    fn test_is_sse_done() {
        assert!(is_sse_done("[DONE]"));
        assert!(is_sse_done("  [DONE]  "));
        assert!(!is_sse_done("{}"));
    }

    #[test]
    fn drain_events_handles_partial_chunks() {
        let mut buffer = Vec::new();
        let events = drain_sse_events(&mut buffer, b"data: {\"id\":");
        assert!(events.is_empty());

        let events = drain_sse_events(&mut buffer, b"1}\n\ndata: partial");
        assert_eq!(events, vec!["data: {\"id\":1}"]);
        assert_eq!(buffer, b"data: partial");

        let events = drain_sse_events(&mut buffer, b"\n\n");
        assert_eq!(events, vec!["data: partial"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_events_handles_crlf() {
        let mut buffer = Vec::new();
        let events = drain_sse_events(&mut buffer, b"event: delta\r\ndata: ok\r\n\r\n");
        assert_eq!(events, vec!["event: delta\r\ndata: ok"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_events_splits_back_to_back_blocks() {
        let mut buffer = Vec::new();
        let events = drain_sse_events(&mut buffer, b"data: 1\n\ndata: 2\n\n");
        assert_eq!(events, vec!["data: 1", "data: 2"]);
    }

    #[test]
    fn event_block_accessors() {
        let block = "event: response.completed\ndata: {\"a\":1}\ndata: {\"b\":2}";
        assert_eq!(event_name(block), Some("response.completed"));
        assert_eq!(data_payload(block).unwrap(), "{\"a\":1}\n{\"b\":2}");
        assert_eq!(data_payload(": comment"), None);
        assert_eq!(event_name("data: x"), None);
    }

    #[test]
    fn proxy_url_scheme_completion() {
        let cfg = ProxyConfig {
            proxy_type: "socks5".to_string(),
            url: "127.0.0.1:1080".to_string(),
            username: None,
            password: None,
        };
        assert_eq!(proxy_url(&cfg), "socks5://127.0.0.1:1080");
        let explicit = ProxyConfig {
            proxy_type: "http".to_string(),
            url: "https://proxy.example.com:8443".to_string(),
            username: None,
            password: None,
        };
        assert_eq!(proxy_url(&explicit), "https://proxy.example.com:8443");
    }
}
