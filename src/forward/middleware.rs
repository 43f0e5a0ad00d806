//! Request authentication and tenant gates
//!
//! Resolves the bearer to an apiKey record, checks the per-provider
//! permission flag and the key's restrictions and limits, and computes the
//! sticky-session hash. Each relay route runs exactly one authentication
//! pass.

use axum::http::HeaderMap;

use crate::accounts::record::RouteFamily;
use crate::scheduler;
use crate::store::Store;
use crate::AppState;

use super::apikeys::ApiKey;
use super::error::{ForwardError, ForwardResult};

/// Extract the bearer from the accepted header forms.
///
/// Priority: `Authorization: Bearer`, then `x-api-key`, then
/// `x-goog-api-key`.
pub fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
    {
        let token = auth.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(token) = header_value(headers, header) {
            return Some(token);
        }
    }
    None
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Client address as seen through proxies.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_string();
        }
    }
    header_value(headers, "x-real-ip").unwrap_or_default()
}

pub fn user_agent(headers: &HeaderMap) -> String {
    header_value(headers, "user-agent").unwrap_or_default()
}

/// Releases the per-key concurrency slot when the request finishes,
/// whichever exit path it takes.
pub struct ConcurrencyGuard {
    store: Store,
    counter_key: String,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        let store = self.store.clone();
        let counter_key = self.counter_key.clone();
        tokio::spawn(async move {
            if let Err(e) = store.decr(&counter_key).await {
                crate::logger::warn(
                    "middleware",
                    &format!("Failed to release concurrency slot {}: {}", counter_key, e),
                );
            }
        });
    }
}

/// Reporting-grade key resolution: bearer lookup only, no gates consumed.
/// Used by the models listing and per-key reporting endpoints.
pub async fn resolve_key(state: &AppState, headers: &HeaderMap) -> ForwardResult<ApiKey> {
    let token = extract_request_token(headers)
        .ok_or_else(|| ForwardError::Unauthorized("Missing API key".to_string()))?;
    state
        .api_keys
        .find_by_raw(&token)
        .await?
        .filter(|key| !key.is_deleted)
        .ok_or_else(|| ForwardError::Unauthorized("Invalid API key".to_string()))
}

pub struct AuthedRequest {
    pub key: ApiKey,
    pub session_hash: String,
    pub user_agent: String,
    /// Held for the request lifetime; releasing happens on drop.
    pub guard: Option<ConcurrencyGuard>,
}

/// Full authentication and gate pass for one relay request.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    family: RouteFamily,
) -> ForwardResult<AuthedRequest> {
    let token = extract_request_token(headers)
        .ok_or_else(|| ForwardError::Unauthorized("Missing API key".to_string()))?;

    let key = state
        .api_keys
        .find_by_raw(&token)
        .await?
        .filter(|key| !key.is_deleted)
        .ok_or_else(|| ForwardError::Unauthorized("Invalid API key".to_string()))?;

    if !key.permissions.allows(family) {
        return Err(ForwardError::PermissionDenied(format!(
            "This API key has no {} permission",
            family.as_str()
        )));
    }

    let ua = user_agent(headers);
    if !key.allows_client(&ua) {
        return Err(ForwardError::PermissionDenied(
            "Client is not allowed for this API key".to_string(),
        ));
    }

    if key.token_limit > 0 {
        let used = state.ledger.total_tokens(&key.id).await?;
        if used >= key.token_limit {
            return Err(ForwardError::RateLimited(
                "API key token quota exhausted".to_string(),
            ));
        }
    }

    if key.daily_cost_limit > 0.0 {
        let spent = state.ledger.daily_cost(&key.id).await?;
        if spent >= key.daily_cost_limit {
            return Err(ForwardError::RateLimited(
                "Daily cost limit exceeded".to_string(),
            ));
        }
    }

    if key.rate_limit_requests > 0 {
        let (requests, _, _) = state
            .ledger
            .current_window(&key.id, key.rate_limit_window_minutes)
            .await?;
        if requests >= key.rate_limit_requests {
            return Err(ForwardError::RateLimited(format!(
                "Request rate limit exceeded: {} per {} minutes",
                key.rate_limit_requests, key.rate_limit_window_minutes
            )));
        }
        state.ledger.incr_window_requests(&key.id).await?;
    }

    let guard = if key.concurrency_limit > 0 {
        let counter_key = format!("concurrency:{}", key.id);
        let in_flight = state.store.incr_by(&counter_key, 1).await?;
        // Safety valve: a crashed process must not pin slots forever.
        state.store.expire(&counter_key, 600).await?;
        if in_flight > key.concurrency_limit {
            state.store.decr(&counter_key).await?;
            return Err(ForwardError::RateLimited(format!(
                "Concurrency limit exceeded: {} in flight",
                key.concurrency_limit
            )));
        }
        Some(ConcurrencyGuard {
            store: state.store.clone(),
            counter_key,
        })
    } else {
        None
    };

    let session_hash = scheduler::session_hash(&ua, &client_ip(headers), &token);

    crate::logger::debug(
        "middleware",
        &format!(
            "Authenticated key: id={}, family={}, session={}",
            key.id,
            family.as_str(),
            &session_hash[..12]
        ),
    );

    Ok(AuthedRequest {
        key,
        session_hash,
        user_agent: ua,
        guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_extraction_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("goog-key"));
        headers.insert("x-api-key", HeaderValue::from_static("anthropic-key"));
        assert_eq!(extract_request_token(&headers).as_deref(), Some("anthropic-key"));

        headers.insert("authorization", HeaderValue::from_static("Bearer bearer-key"));
        assert_eq!(extract_request_token(&headers).as_deref(), Some("bearer-key"));

        let empty = HeaderMap::new();
        assert_eq!(extract_request_token(&empty), None);
    }

    #[test]
    fn bearer_requires_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_request_token(&headers), None);
    }

    #[test]
    fn forwarded_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.9");

        let mut real = HeaderMap::new();
        real.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_ip(&real), "198.51.100.4");
        assert_eq!(client_ip(&HeaderMap::new()), "");
    }
}
