//! Forward module
//!
//! The dispatch pipeline: inbound dialect routes, tenant authentication,
//! scheduler-driven account selection, upstream transport and the
//! streaming relay.
//!
//! ```text
//! Request -> middleware (auth, gates) -> scheduler -> handler -> upstream
//!                 |                          |            |
//!                 v                          v            v
//!           ApiKey record               AccountRef   relay / JSON
//! ```

pub mod apikeys;
pub mod client;
pub mod context;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod relay;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::accounts::record::RouteFamily;
use crate::AppState;

use context::{resolve_selection, AccountRef, UsageRecorder};
use error::{ForwardError, ForwardResult};
use middleware::ConcurrencyGuard;
use relay::{UsageAccumulator, UsageStyle};

/// Attach the concurrency guard to the response so the slot is held until
/// the response body (streams included) finishes.
fn finish(result: ForwardResult<(Response, Option<ConcurrencyGuard>)>) -> Response {
    match result {
        Ok((mut response, guard)) => {
            if let Some(guard) = guard {
                response.extensions_mut().insert(Arc::new(guard));
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

// ----------------------------------------------------------------------
// Anthropic messages
// ----------------------------------------------------------------------

/// POST `/v1/messages` (and `/messages`).
pub async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    finish(handlers::anthropic::messages(&state, &headers, payload).await)
}

// ----------------------------------------------------------------------
// OpenAI chat completions (native or Gemini bridge)
// ----------------------------------------------------------------------

/// POST `/v1/chat/completions`. Gemini-prefixed models are served through
/// the translation bridge; everything else expects an OpenAI-compatible
/// API-key upstream.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    finish(chat_completions_inner(&state, &headers, payload).await)
}

async fn chat_completions_inner(
    state: &AppState,
    headers: &HeaderMap,
    payload: Value,
) -> ForwardResult<(Response, Option<ConcurrencyGuard>)> {
    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ForwardError::InvalidRequest("Missing 'model' field".to_string()))?
        .to_string();

    if model.starts_with("gemini") {
        let mut auth = middleware::authenticate(state, headers, RouteFamily::Gemini).await?;
        if !auth.key.allows_model(&model) {
            return Err(ForwardError::PermissionDenied(format!(
                "Model '{}' is not allowed for this API key",
                model
            )));
        }
        let response =
            handlers::gemini::bridge_chat_completions(state, &mut auth, &model, &payload).await?;
        return Ok((response, auth.guard.take()));
    }

    let mut auth = middleware::authenticate(state, headers, RouteFamily::Openai).await?;
    if !auth.key.allows_model(&model) {
        return Err(ForwardError::PermissionDenied(format!(
            "Model '{}' is not allowed for this API key",
            model
        )));
    }
    let response = openai_chat_dispatch(state, &auth, &model, payload).await?;
    Ok((response, auth.guard.take()))
}

async fn openai_chat_dispatch(
    state: &AppState,
    auth: &middleware::AuthedRequest,
    model: &str,
    mut payload: Value,
) -> ForwardResult<Response> {
    use crate::scheduler::SelectOptions;

    let selection = state
        .scheduler
        .select(
            &auth.key,
            RouteFamily::Openai,
            Some(&auth.session_hash),
            Some(model),
            SelectOptions {
                allow_api_accounts: true,
            },
        )
        .await?;
    let (_, account_ref) = resolve_selection(state, &selection).await?;

    let AccountRef::ApiKey {
        api_key,
        base_url,
        proxy,
        ..
    } = &account_ref
    else {
        return Err(ForwardError::InvalidAccountType(
            "Chat completions require an OpenAI-compatible API-key account".to_string(),
        ));
    };
    let base = base_url.clone().ok_or_else(|| {
        ForwardError::ConfigurationRequired(
            "OpenAI-compatible account has no base URL configured".to_string(),
        )
    })?;
    let url = format!("{}/chat/completions", base);

    let stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if stream {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }
    }

    let mut upstream_headers = reqwest::header::HeaderMap::new();
    upstream_headers.insert(
        "content-type",
        reqwest::header::HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key)) {
        upstream_headers.insert("authorization", value);
    }
    // Azure deployments authenticate with `api-key`; sending both is
    // harmless for OpenAI-compatible servers.
    if let Ok(value) = reqwest::header::HeaderValue::from_str(api_key) {
        upstream_headers.insert("api-key", value);
    }
    if stream {
        upstream_headers.insert(
            "accept",
            reqwest::header::HeaderValue::from_static("text/event-stream"),
        );
    }

    let http = if stream {
        client::streaming_client(proxy.as_ref())?
    } else {
        client::default_client(proxy.as_ref())?
    };
    let upstream = client::post_json(&http, &url, upstream_headers, &payload).await?;
    let status = upstream.status();
    if !status.is_success() {
        let body = handlers::read_error_body(upstream).await;
        return Err(handlers::handle_upstream_failure(state, &account_ref, status.as_u16(), body).await);
    }
    handlers::mark_account_used(state, &account_ref).await;

    let recorder = UsageRecorder::new(state.ledger.clone(), &auth.key, account_ref.id(), model);
    if stream {
        return Ok(relay::relay_sse(upstream, UsageStyle::OpenaiChat, move |delta| {
            recorder.record(delta)
        }));
    }

    let body: Value = upstream
        .json()
        .await
        .map_err(|e| ForwardError::Internal(format!("Failed to parse response: {}", e)))?;
    let mut acc = UsageAccumulator::default();
    acc.observe(UsageStyle::OpenaiChat, None, &body);
    if let Some(delta) = acc.finalize() {
        recorder.record(delta);
    }
    Ok(Json(body).into_response())
}

// ----------------------------------------------------------------------
// Codex responses
// ----------------------------------------------------------------------

/// POST `/responses` and `/v1/responses`.
pub async fn codex_responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    finish(handlers::codex::responses(&state, &headers, payload, false).await)
}

/// POST `/responses/compact` and `/v1/responses/compact`.
pub async fn codex_responses_compact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    finish(handlers::codex::responses(&state, &headers, payload, true).await)
}

// ----------------------------------------------------------------------
// Gemini surfaces
// ----------------------------------------------------------------------

/// POST `/v1beta/models/{model}:{action}`.
pub async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    finish(handlers::gemini::generate(&state, &headers, &model_action, payload).await)
}

/// GET `/v1beta/models`.
pub async fn gemini_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    match handlers::gemini::list_models(&state, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// POST `/{v1internal:action}`, matched as a single root segment.
pub async fn v1internal_entry(
    State(state): State<Arc<AppState>>,
    Path(segment): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let Some(action) = segment.strip_prefix("v1internal:").filter(|a| !a.is_empty()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    finish(handlers::gemini::v1internal(&state, &headers, action, payload).await)
}

// ----------------------------------------------------------------------
// Models listing (OpenAI shape)
// ----------------------------------------------------------------------

/// GET `/v1/models` and `/models`.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = middleware::resolve_key(&state, &headers).await {
        return e.into_response();
    }
    let models: Vec<Value> = crate::pricing::known_models()
        .iter()
        .map(|m| {
            json!({
                "id": m,
                "object": "model",
                "created": 1700000000,
                "owned_by": "relay-gateway",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": models })).into_response()
}

// ----------------------------------------------------------------------
// Per-key reporting
// ----------------------------------------------------------------------

/// GET `/usage`: the caller's aggregated usage.
pub async fn usage_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    match usage_report_inner(&state, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn usage_report_inner(state: &AppState, headers: &HeaderMap) -> ForwardResult<Response> {
    let key = middleware::resolve_key(state, headers).await?;
    let usage = state.ledger.key_usage(&key.id).await?;
    Ok(Json(json!({
        "id": key.id,
        "name": key.name,
        "usage": usage,
    }))
    .into_response())
}

/// GET `/key-info`: key profile, limits and usage.
pub async fn key_info(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    match key_info_inner(&state, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn key_info_inner(state: &AppState, headers: &HeaderMap) -> ForwardResult<Response> {
    let key = middleware::resolve_key(state, headers).await?;
    let usage = state.ledger.key_usage(&key.id).await?;
    Ok(Json(json!({
        "id": key.id,
        "name": key.name,
        "description": key.description,
        "permissions": key.permissions.as_str(),
        "limits": {
            "tokenLimit": key.token_limit,
            "rateLimitRequests": key.rate_limit_requests,
            "rateLimitWindow": key.rate_limit_window_minutes,
            "concurrencyLimit": key.concurrency_limit,
            "dailyCostLimit": key.daily_cost_limit,
        },
        "restrictions": {
            "enableModelRestriction": key.enable_model_restriction,
            "restrictedModels": key.restricted_models.iter().collect::<Vec<_>>(),
            "enableClientRestriction": key.enable_client_restriction,
            "allowedClients": key.allowed_clients,
        },
        "usage": usage,
    }))
    .into_response())
}

/// Health check.
pub async fn api_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
