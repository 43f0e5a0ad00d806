//! Dialect handlers
//!
//! One module per upstream dialect family plus the dispatch plumbing they
//! share: upstream failure classification (which feeds the account state
//! machine) and error-body normalisation.

pub mod anthropic;
pub mod codex;
pub mod gemini;

use serde_json::Value;

use crate::AppState;

use super::context::AccountRef;
use super::error::ForwardError;

/// Read an upstream error body, tolerating non-JSON payloads.
pub async fn read_error_body(response: reqwest::Response) -> Value {
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str(&text) {
        Ok(json) => json,
        Err(_) if text.is_empty() => Value::Null,
        Err(_) => serde_json::json!({ "raw": text }),
    }
}

/// Upstream-advertised rate-limit duration, in minutes.
///
/// Looks for `resets_in_seconds` at the top level or under `error`; some
/// upstreams advertise `retry_after` seconds instead.
pub fn reset_minutes_from_body(body: &Value) -> Option<i64> {
    let seconds = body
        .get("resets_in_seconds")
        .or_else(|| body.pointer("/error/resets_in_seconds"))
        .or_else(|| body.get("retry_after"))
        .or_else(|| body.pointer("/error/retry_after"))
        .and_then(|v| v.as_i64())?;
    if seconds <= 0 {
        return None;
    }
    // Round up so the account never recovers before the upstream does.
    Some((seconds + 59) / 60)
}

/// Classify a failed upstream status, mark the serving account and build
/// the pass-through error. The request fails to the client with the
/// upstream status; the dispatcher never retries another account.
pub async fn handle_upstream_failure(
    state: &AppState,
    account: &AccountRef,
    status: u16,
    body: Value,
) -> ForwardError {
    let platform = account.platform();
    let id = account.id();
    match status {
        429 => {
            let duration = reset_minutes_from_body(&body);
            if let Err(e) = state
                .accounts
                .set_rate_limited(platform, id, true, duration)
                .await
            {
                crate::logger::error(
                    "dispatch",
                    &format!("Failed to mark account rate limited: {}", e),
                );
            }
        }
        401 | 402 => {
            let reason = format!("upstream returned {}", status);
            if let Err(e) = state.accounts.mark_unauthorized(platform, id, &reason).await {
                crate::logger::error(
                    "dispatch",
                    &format!("Failed to mark account unauthorized: {}", e),
                );
            }
        }
        _ => {}
    }
    ForwardError::Upstream { status, body }
}

/// Note a successful dispatch on the account record.
pub async fn mark_account_used(state: &AppState, account: &AccountRef) {
    if let Err(e) = state
        .accounts
        .mark_used(account.platform(), account.id())
        .await
    {
        crate::logger::warn("dispatch", &format!("mark_used failed: {}", e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_minutes_rounds_up() {
        let body = serde_json::json!({
            "error": {"type": "usage_limit_reached", "resets_in_seconds": 600}
        });
        assert_eq!(reset_minutes_from_body(&body), Some(10));

        let uneven = serde_json::json!({"resets_in_seconds": 61});
        assert_eq!(reset_minutes_from_body(&uneven), Some(2));

        let none = serde_json::json!({"error": {"type": "rate_limit"}});
        assert_eq!(reset_minutes_from_body(&none), None);

        let negative = serde_json::json!({"resets_in_seconds": -5});
        assert_eq!(reset_minutes_from_body(&negative), None);
    }
}
