//! Anthropic messages dialect handler
//!
//! Serves `/v1/messages` for the Claude account family. OAuth accounts hit
//! the official API with a bearer token; console/relay accounts use their
//! configured base URL with an `x-api-key`. Requests and responses pass
//! through untranslated; this dialect is native on both sides.

use axum::{
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use reqwest::header::HeaderValue;
use serde_json::Value;

use crate::accounts::record::RouteFamily;
use crate::config;
use crate::forward::client;
use crate::forward::context::{resolve_selection, AccountRef, UsageRecorder};
use crate::forward::error::{ForwardError, ForwardResult};
use crate::forward::middleware::{self, ConcurrencyGuard};
use crate::forward::relay::{self, UsageAccumulator, UsageStyle};
use crate::AppState;

use super::{handle_upstream_failure, mark_account_used, read_error_body};

fn validate(payload: &Value) -> ForwardResult<String> {
    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ForwardError::InvalidRequest("Missing 'model' field".to_string()))?;
    let has_messages = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|m| !m.is_empty())
        .unwrap_or(false);
    if !has_messages {
        return Err(ForwardError::InvalidRequest(
            "messages must be a non-empty array".to_string(),
        ));
    }
    Ok(model.to_string())
}

fn extract_usage(body: &Value) -> Option<crate::usage::UsageDelta> {
    let usage = body.get("usage")?;
    let mut acc = UsageAccumulator::default();
    // The non-stream response carries the full usage object directly.
    acc.observe(
        UsageStyle::Anthropic,
        None,
        &serde_json::json!({ "message": { "usage": usage } }),
    );
    acc.observe(
        UsageStyle::Anthropic,
        None,
        &serde_json::json!({ "type": "message_delta", "usage": usage }),
    );
    acc.finalize()
}

/// POST `/v1/messages`.
pub async fn messages(
    state: &AppState,
    headers: &HeaderMap,
    mut payload: Value,
) -> ForwardResult<(Response, Option<ConcurrencyGuard>)> {
    let model = validate(&payload)?;

    let mut auth = middleware::authenticate(state, headers, RouteFamily::Claude).await?;
    if !auth.key.allows_model(&model) {
        return Err(ForwardError::PermissionDenied(format!(
            "Model '{}' is not allowed for this API key",
            model
        )));
    }

    // Claude-official selections honor the global session binding mode.
    let selection = state
        .scheduler
        .select_claude(&auth.key, Some(&auth.session_hash), Some(&model), &payload)
        .await?;
    let (_, account_ref) = resolve_selection(state, &selection).await?;

    let stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let cfg = config::load();
    let (url, mut upstream_headers) = match &account_ref {
        AccountRef::Oauth { access_token, .. } => {
            let mut h = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", access_token)) {
                h.insert("authorization", value);
            }
            (format!("{}/v1/messages", cfg.claude_api_base), h)
        }
        AccountRef::ApiKey {
            api_key, base_url, ..
        } => {
            let base = base_url
                .clone()
                .unwrap_or_else(|| cfg.claude_api_base.clone());
            let mut h = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(api_key) {
                h.insert("x-api-key", value);
            }
            (format!("{}/v1/messages", base), h)
        }
        AccountRef::AwsCreds { .. } => {
            return Err(ForwardError::ConfigurationRequired(
                "Selected account family cannot serve Anthropic requests".to_string(),
            ))
        }
    };

    upstream_headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&cfg.anthropic_version) {
        upstream_headers.insert("anthropic-version", value);
    }
    if stream {
        upstream_headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        upstream_headers.insert("accept-encoding", HeaderValue::from_static("identity"));
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }
    }

    crate::logger::info(
        "anthropic",
        &format!(
            "Dispatching messages request: model={}, account={}, streaming={}",
            model,
            account_ref.id(),
            stream
        ),
    );

    let http = if stream {
        client::streaming_client(account_ref.proxy())?
    } else {
        client::default_client(account_ref.proxy())?
    };
    let upstream = client::post_json(&http, &url, upstream_headers, &payload).await?;
    let status = upstream.status();
    if !status.is_success() {
        let body = read_error_body(upstream).await;
        return Err(handle_upstream_failure(state, &account_ref, status.as_u16(), body).await);
    }
    mark_account_used(state, &account_ref).await;

    let recorder = UsageRecorder::new(state.ledger.clone(), &auth.key, account_ref.id(), &model);
    let response = if stream {
        relay::relay_sse(upstream, UsageStyle::Anthropic, move |delta| {
            recorder.record(delta)
        })
    } else {
        let body: Value = upstream
            .json()
            .await
            .map_err(|e| ForwardError::Internal(format!("Failed to parse response: {}", e)))?;
        if let Some(delta) = extract_usage(&body) {
            recorder.record(delta);
        }
        Json(body).into_response()
    };

    Ok((response, auth.guard.take()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_requires_model_and_messages() {
        assert!(validate(&json!({"messages": [{"role": "user", "content": "hi"}]})).is_err());
        assert!(validate(&json!({"model": "claude-sonnet-4-20250514", "messages": []})).is_err());
        let ok = validate(&json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        assert_eq!(ok.unwrap(), "claude-sonnet-4-20250514");
    }

    #[test]
    fn non_stream_usage_extraction() {
        let body = json!({
            "type": "message",
            "usage": {
                "input_tokens": 12,
                "output_tokens": 34,
                "cache_creation_input_tokens": 2,
                "cache_read_input_tokens": 5,
            }
        });
        let delta = extract_usage(&body).unwrap();
        assert_eq!(delta.input_tokens, 12);
        assert_eq!(delta.output_tokens, 34);
        assert_eq!(delta.cache_create_tokens, 2);
        assert_eq!(delta.cache_read_tokens, 5);
        assert!(extract_usage(&json!({"type": "message"})).is_none());
    }
}
