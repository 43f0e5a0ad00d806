//! Webhook notifier
//!
//! Fire-and-forget account anomaly/recovery notifications. Delivery is
//! best effort: up to three attempts with exponential backoff, failures
//! are logged and never propagated to the request path.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvent {
    pub account_id: String,
    pub account_name: String,
    pub platform: String,
    pub status: String,
    pub error_code: String,
    pub reason: String,
    pub timestamp: String,
}

#[derive(Clone)]
pub struct WebhookNotifier {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { url, client }
    }

    /// Queue a notification. Returns immediately; delivery happens on a
    /// detached task.
    pub fn notify(&self, event: AccountEvent) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            for attempt in 1u32..=3 {
                match client.post(&url).json(&event).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        crate::logger::debug(
                            "webhook",
                            &format!(
                                "Delivered account event: account={}, status={}",
                                event.account_id, event.status
                            ),
                        );
                        return;
                    }
                    Ok(resp) => {
                        crate::logger::warn(
                            "webhook",
                            &format!(
                                "Webhook endpoint returned {}: attempt {}/3",
                                resp.status(),
                                attempt
                            ),
                        );
                    }
                    Err(e) => {
                        crate::logger::warn(
                            "webhook",
                            &format!("Webhook delivery failed: attempt {}/3, error={}", attempt, e),
                        );
                    }
                }
                if attempt < 3 {
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                }
            }
            crate::logger::error(
                "webhook",
                &format!(
                    "Giving up on account event after 3 attempts: account={}, status={}",
                    event.account_id, event.status
                ),
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_camel_case() {
        let event = AccountEvent {
            account_id: "a1".to_string(),
            account_name: "primary".to_string(),
            platform: "claude".to_string(),
            status: "unauthorized".to_string(),
            error_code: "UNAUTHORIZED".to_string(),
            reason: "upstream 401".to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["accountId"], "a1");
        assert_eq!(json["errorCode"], "UNAUTHORIZED");
        assert!(json.get("account_id").is_none());
    }
}
