//! Gemini dialect handler
//!
//! Serves the standard `v1beta` surface (`generateContent`,
//! `streamGenerateContent`, models listing), the Gemini CLI `v1internal`
//! dialect, and the OpenAI-chat bridge. OAuth accounts dispatch through the
//! Cloud Code Assist internal endpoint (request wrapped, response envelope
//! unwrapped for standard clients); API-key accounts dispatch against the
//! public Gemini API with `functionResponse` sanitisation.

use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::accounts::record::{Account, RouteFamily};
use crate::config;
use crate::forward::client::{self, drain_sse_events};
use crate::forward::context::{resolve_selection, AccountRef, UsageRecorder};
use crate::forward::error::{ForwardError, ForwardResult};
use crate::forward::middleware::{self, AuthedRequest};
use crate::forward::relay::{self, UsageAccumulator, UsageStyle};
use crate::scheduler::SelectOptions;
use crate::AppState;

use super::{handle_upstream_failure, mark_account_used, read_error_body};

/// Request fields forwarded to Gemini; everything else is dropped.
const ALLOWED_FIELDS: &[&str] = &[
    "contents",
    "generationConfig",
    "safetySettings",
    "tools",
    "toolConfig",
    "systemInstruction",
    "cachedContent",
];

const ACTION_GENERATE: &str = "generateContent";
const ACTION_STREAM: &str = "streamGenerateContent";

// ----------------------------------------------------------------------
// URL building
// ----------------------------------------------------------------------

/// Compose a public Gemini API action URL. `base_url` may or may not
/// already end with `/v1beta/models`.
pub fn build_gemini_url(
    base_url: &str,
    model: &str,
    action: &str,
    api_key: &str,
    stream: bool,
) -> String {
    let base = models_base(base_url);
    let mut url = format!("{}/{}:{}?key={}", base, model, action, api_key);
    if stream {
        url.push_str("&alt=sse");
    }
    url
}

/// List-form URL: `<base>[/v1beta/models]?key=<key>`.
pub fn build_models_list_url(base_url: &str, api_key: &str) -> String {
    format!("{}?key={}", models_base(base_url), api_key)
}

fn models_base(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1beta/models") {
        trimmed.to_string()
    } else {
        format!("{}/v1beta/models", trimmed)
    }
}

// ----------------------------------------------------------------------
// Request shaping
// ----------------------------------------------------------------------

/// Filter an inbound standard-Gemini body down to the allowed fields and
/// apply the `systemInstruction` rule: included only when it carries at
/// least one non-empty text part, with `role: user` assigned if absent
/// (the Cloud Code Assist endpoint requires it).
pub fn build_standard_request(payload: &Value) -> Value {
    let Some(obj) = payload.as_object() else {
        return payload.clone();
    };
    let mut filtered = serde_json::Map::new();
    for (key, value) in obj {
        if !ALLOWED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if key == "systemInstruction" {
            if let Some(instruction) = usable_system_instruction(value) {
                filtered.insert(key.clone(), instruction);
            }
            continue;
        }
        filtered.insert(key.clone(), value.clone());
    }
    Value::Object(filtered)
}

fn usable_system_instruction(instruction: &Value) -> Option<Value> {
    let has_text = instruction
        .get("parts")
        .and_then(|parts| parts.as_array())
        .map(|parts| {
            parts.iter().any(|part| {
                part.get("text")
                    .and_then(|t| t.as_str())
                    .map(|t| !t.trim().is_empty())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);
    if !has_text {
        return None;
    }
    let mut instruction = instruction.clone();
    if instruction.get("role").is_none() {
        instruction["role"] = Value::String("user".to_string());
    }
    Some(instruction)
}

/// The public Gemini API rejects extra keys (notably `id`) inside
/// `functionResponse` parts; strip everything but `{name, response}`.
/// Applied for API-key accounts only.
pub fn sanitize_function_responses(body: &mut Value) {
    let Some(contents) = body.get_mut("contents").and_then(|c| c.as_array_mut()) else {
        return;
    };
    for content in contents {
        let Some(parts) = content.get_mut("parts").and_then(|p| p.as_array_mut()) else {
            continue;
        };
        for part in parts {
            let Some(response) = part.get_mut("functionResponse") else {
                continue;
            };
            let Some(obj) = response.as_object_mut() else {
                continue;
            };
            obj.retain(|key, _| key == "name" || key == "response");
        }
    }
}

fn synth_user_prompt_id() -> String {
    format!("{}########0", Uuid::new_v4())
}

fn validate_contents(payload: &Value) -> ForwardResult<()> {
    let non_empty = payload
        .get("contents")
        .and_then(|c| c.as_array())
        .map(|c| !c.is_empty())
        .unwrap_or(false);
    if non_empty {
        Ok(())
    } else {
        Err(ForwardError::InvalidRequest(
            "contents must be a non-empty array".to_string(),
        ))
    }
}

fn parse_model_action(segment: &str) -> ForwardResult<(String, String)> {
    let (model, action) = segment.split_once(':').ok_or_else(|| {
        ForwardError::InvalidRequest(format!("Malformed model action '{}'", segment))
    })?;
    if model.is_empty() {
        return Err(ForwardError::InvalidRequest("Missing model".to_string()));
    }
    Ok((model.to_string(), action.to_string()))
}

fn extract_usage(style: UsageStyle, body: &Value) -> Option<crate::usage::UsageDelta> {
    let mut acc = UsageAccumulator::default();
    acc.observe(style, None, body);
    acc.finalize()
}

// ----------------------------------------------------------------------
// Route handlers
// ----------------------------------------------------------------------

/// POST `/v1beta/models/{model}:{action}`, the standard Gemini surface.
pub async fn generate(
    state: &AppState,
    headers: &HeaderMap,
    model_action: &str,
    payload: Value,
) -> ForwardResult<(Response, Option<middleware::ConcurrencyGuard>)> {
    let (model, action) = parse_model_action(model_action)?;
    if action != ACTION_GENERATE && action != ACTION_STREAM {
        return Err(ForwardError::InvalidRequest(format!(
            "Unsupported action '{}'",
            action
        )));
    }
    validate_contents(&payload)?;

    let mut auth = middleware::authenticate(state, headers, RouteFamily::Gemini).await?;
    if !auth.key.allows_model(&model) {
        return Err(ForwardError::PermissionDenied(format!(
            "Model '{}' is not allowed for this API key",
            model
        )));
    }

    let selection = state
        .scheduler
        .select(
            &auth.key,
            RouteFamily::Gemini,
            Some(&auth.session_hash),
            Some(&model),
            SelectOptions {
                allow_api_accounts: true,
            },
        )
        .await?;
    let (account, account_ref) = resolve_selection(state, &selection).await?;

    let stream = action == ACTION_STREAM;
    let standard = build_standard_request(&payload);
    let recorder = UsageRecorder::new(state.ledger.clone(), &auth.key, account_ref.id(), &model);

    let response = match &account_ref {
        AccountRef::Oauth { .. } => {
            dispatch_cloud_code(
                state,
                &account,
                &account_ref,
                &model,
                standard,
                stream,
                recorder,
                CloudCodeOutput::Standard,
            )
            .await?
        }
        AccountRef::ApiKey { .. } => {
            dispatch_public_api(
                state,
                &account_ref,
                &model,
                standard,
                stream,
                recorder,
                PublicApiOutput::Standard,
            )
            .await?
        }
        AccountRef::AwsCreds { .. } => {
            return Err(ForwardError::ConfigurationRequired(
                "Selected account family cannot serve Gemini requests".to_string(),
            ))
        }
    };

    Ok((response, auth.guard.take()))
}

/// POST `/v1internal:{action}`, the Gemini CLI dialect. OAuth accounts only.
pub async fn v1internal(
    state: &AppState,
    headers: &HeaderMap,
    action: &str,
    mut payload: Value,
) -> ForwardResult<(Response, Option<middleware::ConcurrencyGuard>)> {
    let mut auth = middleware::authenticate(state, headers, RouteFamily::Gemini).await?;
    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(model) = model.as_deref() {
        if !auth.key.allows_model(model) {
            return Err(ForwardError::PermissionDenied(format!(
                "Model '{}' is not allowed for this API key",
                model
            )));
        }
    }

    let selection = state
        .scheduler
        .select(
            &auth.key,
            RouteFamily::Gemini,
            Some(&auth.session_hash),
            model.as_deref(),
            SelectOptions {
                allow_api_accounts: true,
            },
        )
        .await?;
    let (account, account_ref) = resolve_selection(state, &selection).await?;

    let AccountRef::Oauth {
        access_token,
        proxy,
        ..
    } = &account_ref
    else {
        return Err(ForwardError::InvalidAccountType(
            "v1internal requires an OAuth Gemini account".to_string(),
        ));
    };

    let stream = action == ACTION_STREAM;
    let generate_action = action == ACTION_GENERATE || stream;

    if generate_action {
        validate_contents(payload.get("request").unwrap_or(&Value::Null))?;
        if payload.get("user_prompt_id").and_then(|v| v.as_str()).is_none() {
            payload["user_prompt_id"] = Value::String(synth_user_prompt_id());
        }
        let project = ensure_project(state, &account, access_token, proxy.as_ref()).await?;
        payload["project"] = Value::String(project);
    }

    let cfg = config::load();
    let mut url = format!("{}/v1internal:{}", cfg.gemini_cloud_code_base, action);
    if stream {
        url.push_str("?alt=sse");
    }

    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", access_token)) {
        upstream_headers.insert("authorization", value);
    }
    if stream {
        upstream_headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    }

    let http = if stream {
        client::streaming_client(proxy.as_ref())?
    } else {
        client::default_client(proxy.as_ref())?
    };
    let upstream = client::post_json(&http, &url, upstream_headers, &payload).await?;
    let status = upstream.status();
    if !status.is_success() {
        let body = read_error_body(upstream).await;
        return Err(handle_upstream_failure(state, &account_ref, status.as_u16(), body).await);
    }
    mark_account_used(state, &account_ref).await;

    let model_for_usage = model.unwrap_or_else(|| "gemini".to_string());
    let recorder = UsageRecorder::new(
        state.ledger.clone(),
        &auth.key,
        account_ref.id(),
        &model_for_usage,
    );

    let response = if stream {
        // v1internal clients speak the envelope natively; no unwrapping.
        relay::relay_sse(
            upstream,
            UsageStyle::Gemini {
                unwrap_envelope: false,
            },
            move |delta| recorder.record(delta),
        )
    } else {
        let body: Value = upstream
            .json()
            .await
            .map_err(|e| ForwardError::Internal(format!("Failed to parse response: {}", e)))?;
        if generate_action {
            if let Some(delta) = extract_usage(
                UsageStyle::Gemini {
                    unwrap_envelope: false,
                },
                &body,
            ) {
                recorder.record(delta);
            }
        }
        Json(body).into_response()
    };

    Ok((response, auth.guard.take()))
}

/// GET models listing. API-key accounts proxy the upstream list; OAuth
/// accounts get the static catalogue.
pub async fn list_models(state: &AppState, headers: &HeaderMap) -> ForwardResult<Response> {
    let key = middleware::resolve_key(state, headers).await?;

    let selection = state
        .scheduler
        .select(
            &key,
            RouteFamily::Gemini,
            None,
            None,
            SelectOptions {
                allow_api_accounts: true,
            },
        )
        .await;

    if let Ok(selection) = selection {
        if let Ok((_, AccountRef::ApiKey {
            api_key,
            base_url,
            proxy,
            ..
        })) = resolve_selection(state, &selection).await
        {
            let cfg = config::load();
            let base = base_url.unwrap_or(cfg.gemini_api_base);
            let url = build_models_list_url(&base, &api_key);
            let mut upstream_headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&api_key) {
                upstream_headers.insert("x-goog-api-key", value.clone());
                upstream_headers.insert("x-api-key", value);
            }
            let http = client::default_client(proxy.as_ref())?;
            let upstream = client::get_url(&http, &url, upstream_headers).await?;
            if upstream.status().is_success() {
                let body: Value = upstream
                    .json()
                    .await
                    .map_err(|e| ForwardError::Internal(format!("Failed to parse list: {}", e)))?;
                return Ok(Json(body).into_response());
            }
        }
    }

    let models: Vec<Value> = crate::pricing::known_models()
        .iter()
        .filter(|m| m.starts_with("gemini"))
        .map(|m| {
            json!({
                "name": format!("models/{}", m),
                "displayName": m,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    Ok(Json(json!({ "models": models })).into_response())
}

// ----------------------------------------------------------------------
// Dispatch paths
// ----------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
pub enum CloudCodeOutput {
    /// Unwrap the `{response:{…}}` envelope for standard-Gemini clients.
    Standard,
    /// Convert candidates into OpenAI chat-completion shapes.
    OpenaiChat,
}

#[derive(Clone, Copy, PartialEq)]
pub enum PublicApiOutput {
    Standard,
    OpenaiChat,
}

/// Dispatch through the Cloud Code Assist internal endpoint (OAuth).
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_cloud_code(
    state: &AppState,
    account: &Account,
    account_ref: &AccountRef,
    model: &str,
    standard_body: Value,
    stream: bool,
    recorder: UsageRecorder,
    output: CloudCodeOutput,
) -> ForwardResult<Response> {
    let AccountRef::Oauth {
        access_token,
        proxy,
        ..
    } = account_ref
    else {
        return Err(ForwardError::Internal(
            "cloud-code dispatch requires an OAuth account".to_string(),
        ));
    };

    let project = ensure_project(state, account, access_token, proxy.as_ref()).await?;
    let wrapper = json!({
        "model": model,
        "project": project,
        "user_prompt_id": synth_user_prompt_id(),
        "request": standard_body,
    });

    let cfg = config::load();
    let action = if stream { ACTION_STREAM } else { ACTION_GENERATE };
    let mut url = format!("{}/v1internal:{}", cfg.gemini_cloud_code_base, action);
    if stream {
        url.push_str("?alt=sse");
    }

    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", access_token)) {
        headers.insert("authorization", value);
    }
    if stream {
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    }

    crate::logger::info(
        "gemini",
        &format!(
            "Dispatching cloud-code request: model={}, account={}, streaming={}",
            model,
            account_ref.id(),
            stream
        ),
    );

    let http = if stream {
        client::streaming_client(proxy.as_ref())?
    } else {
        client::default_client(proxy.as_ref())?
    };
    let upstream = client::post_json(&http, &url, headers, &wrapper).await?;
    let status = upstream.status();
    if !status.is_success() {
        let body = read_error_body(upstream).await;
        return Err(handle_upstream_failure(state, account_ref, status.as_u16(), body).await);
    }
    mark_account_used(state, account_ref).await;

    if stream {
        return Ok(match output {
            CloudCodeOutput::Standard => relay::relay_sse(
                upstream,
                UsageStyle::Gemini {
                    unwrap_envelope: true,
                },
                move |delta| recorder.record(delta),
            ),
            CloudCodeOutput::OpenaiChat => {
                relay_gemini_as_openai_chat(upstream, model.to_string(), true, recorder)
            }
        });
    }

    let body: Value = upstream
        .json()
        .await
        .map_err(|e| ForwardError::Internal(format!("Failed to parse response: {}", e)))?;
    if let Some(delta) = extract_usage(
        UsageStyle::Gemini {
            unwrap_envelope: true,
        },
        &body,
    ) {
        recorder.record(delta);
    }
    let inner = body.get("response").cloned().unwrap_or(body);
    Ok(match output {
        CloudCodeOutput::Standard => Json(inner).into_response(),
        CloudCodeOutput::OpenaiChat => Json(gemini_response_to_openai(model, &inner)).into_response(),
    })
}

/// Dispatch against the public Gemini API (API-key account).
pub async fn dispatch_public_api(
    state: &AppState,
    account_ref: &AccountRef,
    model: &str,
    mut body: Value,
    stream: bool,
    recorder: UsageRecorder,
    output: PublicApiOutput,
) -> ForwardResult<Response> {
    let AccountRef::ApiKey {
        api_key,
        base_url,
        proxy,
        ..
    } = account_ref
    else {
        return Err(ForwardError::Internal(
            "public-api dispatch requires an API-key account".to_string(),
        ));
    };

    sanitize_function_responses(&mut body);

    let cfg = config::load();
    let base = base_url.clone().unwrap_or(cfg.gemini_api_base);
    let action = if stream { ACTION_STREAM } else { ACTION_GENERATE };
    let url = build_gemini_url(&base, model, action, api_key, stream);

    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(api_key) {
        headers.insert("x-goog-api-key", value.clone());
        headers.insert("x-api-key", value);
    }
    if stream {
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    }

    let http = if stream {
        client::streaming_client(proxy.as_ref())?
    } else {
        client::default_client(proxy.as_ref())?
    };
    let upstream = client::post_json(&http, &url, headers, &body).await?;
    let status = upstream.status();
    if !status.is_success() {
        let error_body = read_error_body(upstream).await;
        return Err(handle_upstream_failure(state, account_ref, status.as_u16(), error_body).await);
    }
    mark_account_used(state, account_ref).await;

    if stream {
        // Already standard Gemini format; nothing to unwrap.
        return Ok(match output {
            PublicApiOutput::Standard => relay::relay_sse(
                upstream,
                UsageStyle::Gemini {
                    unwrap_envelope: false,
                },
                move |delta| recorder.record(delta),
            ),
            PublicApiOutput::OpenaiChat => {
                relay_gemini_as_openai_chat(upstream, model.to_string(), false, recorder)
            }
        });
    }

    let response_body: Value = upstream
        .json()
        .await
        .map_err(|e| ForwardError::Internal(format!("Failed to parse response: {}", e)))?;
    if let Some(delta) = extract_usage(
        UsageStyle::Gemini {
            unwrap_envelope: false,
        },
        &response_body,
    ) {
        recorder.record(delta);
    }
    Ok(match output {
        PublicApiOutput::Standard => Json(response_body).into_response(),
        PublicApiOutput::OpenaiChat => {
            Json(gemini_response_to_openai(model, &response_body)).into_response()
        }
    })
}

/// Resolve the Cloud Code project id: explicit `projectId` wins, then a
/// previously discovered `tempProjectId`, then loadCodeAssist discovery.
/// A discovered project is saved as `tempProjectId` only; it never
/// overwrites an explicit configuration.
async fn ensure_project(
    state: &AppState,
    account: &Account,
    access_token: &str,
    proxy: Option<&crate::accounts::record::ProxyConfig>,
) -> ForwardResult<String> {
    if let Some(project) = account.project_id.as_deref().filter(|p| !p.is_empty()) {
        return Ok(project.to_string());
    }
    if let Some(project) = account.temp_project_id.as_deref().filter(|p| !p.is_empty()) {
        return Ok(project.to_string());
    }

    let cfg = config::load();
    let url = format!("{}/v1internal:loadCodeAssist", cfg.gemini_cloud_code_base);
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", access_token)) {
        headers.insert("authorization", value);
    }
    let body = json!({ "metadata": { "pluginType": "GEMINI" } });

    let http = client::default_client(proxy)?;
    let response = client::post_json(&http, &url, headers, &body).await?;
    if !response.status().is_success() {
        return Err(ForwardError::ConfigurationRequired(
            "Gemini account has no project id and loadCodeAssist failed".to_string(),
        ));
    }
    let payload: Value = response
        .json()
        .await
        .map_err(|e| ForwardError::Internal(format!("Failed to parse loadCodeAssist: {}", e)))?;
    let project = payload
        .get("cloudaicompanionProject")
        .and_then(|v| v.as_str())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            ForwardError::ConfigurationRequired(
                "loadCodeAssist returned no cloudaicompanionProject".to_string(),
            )
        })?;

    if let Err(e) = state
        .accounts
        .save_temp_project_id(account.platform, &account.id, project)
        .await
    {
        crate::logger::warn(
            "gemini",
            &format!("Failed to persist discovered project id: {}", e),
        );
    }
    Ok(project.to_string())
}

// ----------------------------------------------------------------------
// OpenAI-chat bridge
// ----------------------------------------------------------------------

/// Translate an OpenAI chat-completions body into Gemini contents plus
/// generation config. Unspecified sampling fields take the bridge
/// defaults (0.7 / 4096 / 0.95 / 40).
pub fn openai_chat_to_gemini(payload: &Value) -> ForwardResult<Value> {
    let messages = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            ForwardError::InvalidRequest("messages must be a non-empty array".to_string())
        })?;

    let mut contents = Vec::with_capacity(messages.len());
    for message in messages {
        let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("user");
        let gemini_role = if role == "assistant" { "model" } else { role };
        let text = match message.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        contents.push(json!({
            "role": gemini_role,
            "parts": [{ "text": text }],
        }));
    }

    let number = |field: &str, default: f64| -> f64 {
        payload.get(field).and_then(|v| v.as_f64()).unwrap_or(default)
    };
    let generation_config = json!({
        "temperature": number("temperature", 0.7),
        "maxOutputTokens": payload
            .get("max_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(4096),
        "topP": number("top_p", 0.95),
        "topK": payload.get("top_k").and_then(|v| v.as_i64()).unwrap_or(40),
    });

    Ok(json!({
        "contents": contents,
        "generationConfig": generation_config,
    }))
}

fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

fn candidate_text(response: &Value) -> String {
    response
        .pointer("/candidates/0/content/parts")
        .and_then(|parts| parts.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Render a complete Gemini response as an OpenAI chat completion.
pub fn gemini_response_to_openai(model: &str, response: &Value) -> Value {
    let text = candidate_text(response);
    let finish = response
        .pointer("/candidates/0/finishReason")
        .and_then(|v| v.as_str())
        .map(map_finish_reason)
        .unwrap_or("stop");
    let usage = response.get("usageMetadata");
    let prompt = usage
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish,
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        },
    })
}

fn openai_chunk(id: &str, model: &str, delta: Value, finish: Option<&str>) -> String {
    let chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    });
    format!("data: {}\n\n", chunk)
}

/// Stream a Gemini SSE response to the client as OpenAI chat-completion
/// chunks. Used by the `/v1/chat/completions` bridge.
pub fn relay_gemini_as_openai_chat(
    upstream: reqwest::Response,
    model: String,
    unwrap_envelope: bool,
    recorder: UsageRecorder,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let chunk_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
        let mut stream = upstream.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut acc = UsageAccumulator::default();
        let mut first_chunk = true;
        let mut finish_sent = false;

        'convert: while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tx
                        .send(Ok(relay::synthetic_error_block(&e.to_string())))
                        .await;
                    break 'convert;
                }
            };
            for block in drain_sse_events(&mut buffer, &bytes) {
                let Some(payload) = client::data_payload(&block) else {
                    continue;
                };
                if client::is_sse_done(&payload) {
                    continue;
                }
                let Ok(json) = serde_json::from_str::<Value>(&payload) else {
                    continue;
                };
                acc.observe(
                    UsageStyle::Gemini {
                        unwrap_envelope: false,
                    },
                    None,
                    &json,
                );
                let event = if unwrap_envelope {
                    json.get("response").cloned().unwrap_or(json)
                } else {
                    json
                };

                let text = candidate_text(&event);
                if !text.is_empty() {
                    let delta = if first_chunk {
                        first_chunk = false;
                        json!({ "role": "assistant", "content": text })
                    } else {
                        json!({ "content": text })
                    };
                    let out = openai_chunk(&chunk_id, &model, delta, None);
                    if tx.send(Ok(Bytes::from(out))).await.is_err() {
                        break 'convert;
                    }
                }
                if let Some(reason) = event
                    .pointer("/candidates/0/finishReason")
                    .and_then(|v| v.as_str())
                {
                    finish_sent = true;
                    let out = openai_chunk(
                        &chunk_id,
                        &model,
                        json!({}),
                        Some(map_finish_reason(reason)),
                    );
                    if tx.send(Ok(Bytes::from(out))).await.is_err() {
                        break 'convert;
                    }
                }
            }
        }

        if !finish_sent {
            let out = openai_chunk(&chunk_id, &model, json!({}), Some("stop"));
            let _ = tx.send(Ok(Bytes::from(out))).await;
        }
        let _ = tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await;

        match acc.finalize() {
            Some(delta) => recorder.record(delta),
            None => crate::logger::warn(
                "gemini",
                "Bridged stream ended without usage metadata; nothing recorded",
            ),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(axum::body::Body::from_stream(
            tokio_stream::wrappers::ReceiverStream::new(rx),
        ))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The OpenAI-chat bridge entry: authenticated payload in, Gemini
/// dispatch out, response rendered back in OpenAI shapes.
pub async fn bridge_chat_completions(
    state: &AppState,
    auth: &mut AuthedRequest,
    model: &str,
    payload: &Value,
) -> ForwardResult<Response> {
    let body = openai_chat_to_gemini(payload)?;
    let stream = payload.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let selection = state
        .scheduler
        .select(
            &auth.key,
            RouteFamily::Gemini,
            Some(&auth.session_hash),
            Some(model),
            SelectOptions {
                allow_api_accounts: true,
            },
        )
        .await?;
    let (account, account_ref) = resolve_selection(state, &selection).await?;
    let recorder = UsageRecorder::new(state.ledger.clone(), &auth.key, account_ref.id(), model);

    match &account_ref {
        AccountRef::Oauth { .. } => {
            dispatch_cloud_code(
                state,
                &account,
                &account_ref,
                model,
                body,
                stream,
                recorder,
                CloudCodeOutput::OpenaiChat,
            )
            .await
        }
        AccountRef::ApiKey { .. } => {
            dispatch_public_api(
                state,
                &account_ref,
                model,
                body,
                stream,
                recorder,
                PublicApiOutput::OpenaiChat,
            )
            .await
        }
        AccountRef::AwsCreds { .. } => Err(ForwardError::ConfigurationRequired(
            "Selected account family cannot serve Gemini requests".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_builder_normalizes_base_forms() {
        let bare = build_gemini_url(
            "https://generativelanguage.googleapis.com",
            "gemini-2.5-flash",
            "generateContent",
            "k",
            false,
        );
        let suffixed = build_gemini_url(
            "https://generativelanguage.googleapis.com/v1beta/models/",
            "gemini-2.5-flash",
            "generateContent",
            "k",
            false,
        );
        assert_eq!(bare, suffixed);
        assert_eq!(
            bare,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent?key=k"
        );

        let stream = build_gemini_url("https://x.example", "m", "streamGenerateContent", "k", true);
        assert!(stream.ends_with(":streamGenerateContent?key=k&alt=sse"));

        assert_eq!(
            build_models_list_url("https://x.example/", "k"),
            "https://x.example/v1beta/models?key=k"
        );
    }

    #[test]
    fn standard_request_drops_unknown_fields() {
        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"temperature": 0.2},
            "model": "gemini-2.5-flash",
            "stream": true,
        });
        let body = build_standard_request(&payload);
        assert!(body.get("contents").is_some());
        assert!(body.get("generationConfig").is_some());
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn system_instruction_requires_text_and_gets_role() {
        let empty = json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "systemInstruction": {"parts": [{"text": "   "}]},
        });
        assert!(build_standard_request(&empty).get("systemInstruction").is_none());

        let usable = json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "systemInstruction": {"parts": [{"text": "be brief"}]},
        });
        let body = build_standard_request(&usable);
        assert_eq!(body["systemInstruction"]["role"], "user");

        let with_role = json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "systemInstruction": {"role": "system", "parts": [{"text": "be brief"}]},
        });
        let body = build_standard_request(&with_role);
        assert_eq!(body["systemInstruction"]["role"], "system");
    }

    #[test]
    fn function_response_sanitisation_drops_extra_keys() {
        let mut body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"functionResponse": {"name": "f", "response": {"ok": true}, "id": "call_1", "extra": 1}},
                    {"text": "untouched"}
                ]
            }]
        });
        sanitize_function_responses(&mut body);
        let fr = &body["contents"][0]["parts"][0]["functionResponse"];
        assert_eq!(fr["name"], "f");
        assert_eq!(fr["response"]["ok"], true);
        assert!(fr.get("id").is_none());
        assert!(fr.get("extra").is_none());
        assert_eq!(body["contents"][0]["parts"][1]["text"], "untouched");
    }

    #[test]
    fn empty_contents_rejected() {
        assert!(validate_contents(&json!({"contents": []})).is_err());
        assert!(validate_contents(&json!({})).is_err());
        assert!(validate_contents(&json!({"contents": [{"parts": []}]})).is_ok());
    }

    #[test]
    fn user_prompt_id_shape() {
        let id = synth_user_prompt_id();
        assert!(id.ends_with("########0"));
        assert_eq!(id.len(), 36 + 9);
    }

    #[test]
    fn openai_chat_translation() {
        let payload = json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi there"},
            ],
            "temperature": 0.2,
            "max_tokens": 100,
        });
        let body = openai_chat_to_gemini(&payload).unwrap();
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["temperature"], 0.2);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
        // Bridge defaults fill unspecified sampling fields.
        assert_eq!(body["generationConfig"]["topP"], 0.95);
        assert_eq!(body["generationConfig"]["topK"], 40);

        let defaults = openai_chat_to_gemini(&json!({
            "messages": [{"role": "user", "content": "x"}]
        }))
        .unwrap();
        assert_eq!(defaults["generationConfig"]["temperature"], 0.7);
        assert_eq!(defaults["generationConfig"]["maxOutputTokens"], 4096);

        assert!(openai_chat_to_gemini(&json!({"messages": []})).is_err());
    }

    #[test]
    fn gemini_to_openai_response_conversion() {
        let response = json!({
            "candidates": [{
                "content": {"parts": [{"text": "Hello "}, {"text": "world"}]},
                "finishReason": "MAX_TOKENS",
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 5},
        });
        let openai = gemini_response_to_openai("gemini-2.5-flash", &response);
        assert_eq!(openai["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(openai["choices"][0]["finish_reason"], "length");
        assert_eq!(openai["usage"]["total_tokens"], 8);
        assert_eq!(openai["object"], "chat.completion");
    }
}
