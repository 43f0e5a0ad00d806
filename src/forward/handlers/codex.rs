//! Codex responses dialect handler
//!
//! Serves `/responses` and `/responses/compact` against the ChatGPT codex
//! backend. Requests from the Codex CLIs pass through untouched; anything
//! else is adapted: sampling fields stripped, the fixed instruction block
//! injected and the model id normalised onto the serving family.

use axum::{
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderValue;
use serde_json::Value;
use uuid::Uuid;

use crate::accounts::record::RouteFamily;
use crate::config;
use crate::forward::client;
use crate::forward::context::{resolve_selection, AccountRef, UsageRecorder};
use crate::forward::error::{ForwardError, ForwardResult};
use crate::forward::middleware::{self, ConcurrencyGuard};
use crate::forward::relay::{self, UsageAccumulator, UsageStyle};
use crate::scheduler::SelectOptions;
use crate::AppState;

use super::{handle_upstream_failure, mark_account_used, read_error_body};

/// Native codex clients get a transparent passthrough.
static CODEX_CLIENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(codex_vscode|codex_cli_rs)/\d+(\.\d+)*").expect("static regex"));

/// Fields the codex backend rejects from non-CLI clients.
const STRIPPED_FIELDS: &[&str] = &[
    "temperature",
    "top_p",
    "max_output_tokens",
    "user",
    "text_formatting",
    "truncation",
    "text",
    "service_tier",
];

/// Instruction block injected for adapted (non-CLI) requests.
const CODEX_INSTRUCTIONS: &str = "You are Codex, a coding assistant. \
Respond with precise, well-formed answers; prefer code over prose when the \
request is about code.";

pub fn is_native_codex_client(user_agent: &str) -> bool {
    CODEX_CLIENT_RE.is_match(user_agent)
}

/// `gpt-5-*` variants collapse onto `gpt-5`; `gpt-5-codex` is its own
/// serving family and stays as-is.
pub fn normalize_model(model: &str) -> String {
    if model == "gpt-5-codex" || model.starts_with("gpt-5-codex-") {
        return model.to_string();
    }
    if model.starts_with("gpt-5-") {
        return "gpt-5".to_string();
    }
    model.to_string()
}

/// Shape the request body for the codex backend.
pub fn adapt_request(payload: &Value, native_client: bool, compact: bool) -> Value {
    let mut body = payload.clone();
    let Some(obj) = body.as_object_mut() else {
        return body;
    };

    if let Some(model) = obj.get("model").and_then(|v| v.as_str()) {
        let normalized = normalize_model(model);
        obj.insert("model".to_string(), Value::String(normalized));
    }

    if !native_client {
        for field in STRIPPED_FIELDS {
            obj.remove(*field);
        }
        obj.insert(
            "instructions".to_string(),
            Value::String(CODEX_INSTRUCTIONS.to_string()),
        );
    }

    if compact {
        // The compact endpoint rejects the field outright.
        obj.remove("store");
    } else if !obj.contains_key("store") {
        obj.insert("store".to_string(), Value::Bool(false));
    }

    body
}

/// POST `/responses` and `/responses/compact`.
pub async fn responses(
    state: &AppState,
    headers: &HeaderMap,
    payload: Value,
    compact: bool,
) -> ForwardResult<(Response, Option<ConcurrencyGuard>)> {
    let mut auth = middleware::authenticate(state, headers, RouteFamily::Openai).await?;

    let requested_model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ForwardError::InvalidRequest("Missing 'model' field".to_string()))?;
    let model = normalize_model(requested_model);
    if !auth.key.allows_model(&model) {
        return Err(ForwardError::PermissionDenied(format!(
            "Model '{}' is not allowed for this API key",
            model
        )));
    }

    // Codex dispatch needs a ChatGPT OAuth account; API-key families are
    // gated out.
    let selection = state
        .scheduler
        .select(
            &auth.key,
            RouteFamily::Openai,
            Some(&auth.session_hash),
            Some(&model),
            SelectOptions {
                allow_api_accounts: false,
            },
        )
        .await?;
    let (_, account_ref) = resolve_selection(state, &selection).await?;
    let AccountRef::Oauth {
        access_token,
        chatgpt_user_id,
        proxy,
        ..
    } = &account_ref
    else {
        return Err(ForwardError::InvalidAccountType(
            "Codex responses require an OAuth account".to_string(),
        ));
    };

    let native = is_native_codex_client(&auth.user_agent);
    let body = adapt_request(&payload, native, compact);
    let stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let cfg = config::load();
    let url = if compact {
        format!("{}/responses/compact", cfg.codex_api_base)
    } else {
        format!("{}/responses", cfg.codex_api_base)
    };

    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert("content-type", HeaderValue::from_static("application/json"));
    upstream_headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    upstream_headers.insert("host", HeaderValue::from_static("chatgpt.com"));
    upstream_headers.insert(
        "openai-beta",
        HeaderValue::from_static("responses=experimental"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", access_token)) {
        upstream_headers.insert("authorization", value);
    }
    if let Some(account_id) = chatgpt_user_id.as_deref().filter(|id| !id.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(account_id) {
            upstream_headers.insert("chatgpt-account-id", value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        upstream_headers.insert("session_id", value);
    }
    upstream_headers.insert("version", HeaderValue::from_static("0.21.0"));

    crate::logger::info(
        "codex",
        &format!(
            "Dispatching responses request: model={}, account={}, native={}, compact={}",
            model,
            account_ref.id(),
            native,
            compact
        ),
    );

    let http = if stream {
        client::streaming_client(proxy.as_ref())?
    } else {
        client::default_client(proxy.as_ref())?
    };
    let upstream = client::post_json(&http, &url, upstream_headers, &body).await?;
    let status = upstream.status();
    if !status.is_success() {
        let error_body = read_error_body(upstream).await;
        return Err(handle_upstream_failure(state, &account_ref, status.as_u16(), error_body).await);
    }
    mark_account_used(state, &account_ref).await;

    let recorder = UsageRecorder::new(state.ledger.clone(), &auth.key, account_ref.id(), &model);
    let response = if stream {
        relay::relay_sse(upstream, UsageStyle::OpenaiResponses, move |delta| {
            recorder.record(delta)
        })
    } else {
        let response_body: Value = upstream
            .json()
            .await
            .map_err(|e| ForwardError::Internal(format!("Failed to parse response: {}", e)))?;
        let mut acc = UsageAccumulator::default();
        acc.observe(
            UsageStyle::OpenaiResponses,
            Some("response.completed"),
            &serde_json::json!({ "response": response_body }),
        );
        if let Some(delta) = acc.finalize() {
            recorder.record(delta);
        }
        Json(response_body).into_response()
    };

    Ok((response, auth.guard.take()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn native_client_detection() {
        assert!(is_native_codex_client("codex_cli_rs/0.21.0"));
        assert!(is_native_codex_client("codex_vscode/1.2"));
        assert!(is_native_codex_client("codex_cli_rs/10"));
        assert!(!is_native_codex_client("curl/8"));
        assert!(!is_native_codex_client("codex_cli_rs"));
        assert!(!is_native_codex_client("my_codex_cli_rs/1.0"));
    }

    #[test]
    fn model_normalisation() {
        assert_eq!(normalize_model("gpt-5-2025-08-07"), "gpt-5");
        assert_eq!(normalize_model("gpt-5-preview"), "gpt-5");
        assert_eq!(normalize_model("gpt-5-codex"), "gpt-5-codex");
        assert_eq!(normalize_model("gpt-5"), "gpt-5");
        assert_eq!(normalize_model("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn non_cli_requests_are_adapted() {
        let payload = json!({
            "model": "gpt-5-preview",
            "temperature": 0.5,
            "top_p": 0.9,
            "input": [{"role": "user", "content": "hi"}],
        });
        let body = adapt_request(&payload, false, false);
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_p").is_none());
        assert_eq!(body["instructions"], CODEX_INSTRUCTIONS);
        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["store"], false);
        assert_eq!(body["input"], payload["input"]);
    }

    #[test]
    fn native_requests_keep_their_fields() {
        let payload = json!({
            "model": "gpt-5-codex",
            "temperature": 0.5,
            "store": true,
        });
        let body = adapt_request(&payload, true, false);
        assert_eq!(body["temperature"], 0.5);
        assert!(body.get("instructions").is_none());
        assert_eq!(body["store"], true);
        assert_eq!(body["model"], "gpt-5-codex");
    }

    #[test]
    fn compact_removes_store_entirely() {
        let payload = json!({"model": "gpt-5", "store": true});
        let body = adapt_request(&payload, true, true);
        assert!(body.get("store").is_none());

        let without = adapt_request(&json!({"model": "gpt-5"}), false, true);
        assert!(without.get("store").is_none());
    }
}
