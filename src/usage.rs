//! Usage and rate-limit ledger
//!
//! Atomic counters per apiKey, per account and per (apiKey, model), in
//! three windows: lifetime, daily and monthly. Daily/monthly bucket
//! boundaries use a fixed configured UTC offset so "today" is stable
//! across hosts. Each counter is one atomic store call; there is no
//! cross-counter transaction.

use chrono::{DateTime, FixedOffset, Utc};

use crate::config;
use crate::pricing;
use crate::store::{Store, StoreResult};

const DAILY_TTL_SECS: u64 = 90 * 24 * 3600;
const MONTHLY_TTL_SECS: u64 = 400 * 24 * 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageDelta {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_create_tokens: i64,
    pub cache_read_tokens: i64,
}

impl UsageDelta {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_create_tokens + self.cache_read_tokens
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct WindowUsage {
    pub tokens: i64,
    pub requests: i64,
    #[serde(rename = "inputTokens")]
    pub input_tokens: i64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: i64,
    #[serde(rename = "cacheCreateTokens")]
    pub cache_create_tokens: i64,
    #[serde(rename = "cacheReadTokens")]
    pub cache_read_tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct KeyUsage {
    pub total: WindowUsage,
    pub daily: WindowUsage,
    pub monthly: WindowUsage,
}

/// Date buckets in the configured fixed offset.
pub fn daily_bucket(now: DateTime<Utc>, offset_hours: i32) -> String {
    local_time(now, offset_hours).format("%Y-%m-%d").to_string()
}

pub fn monthly_bucket(now: DateTime<Utc>, offset_hours: i32) -> String {
    local_time(now, offset_hours).format("%Y-%m").to_string()
}

fn local_time(now: DateTime<Utc>, offset_hours: i32) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(offset_hours * 3600)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
    now.with_timezone(&offset)
}

fn counter_key(dim: &str, window: &str, subject: &str) -> String {
    format!("usage:{}:{}:{}", dim, window, subject)
}

#[derive(Clone)]
pub struct UsageLedger {
    store: Store,
}

impl UsageLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn windows(&self, now: DateTime<Utc>) -> (String, String) {
        let offset = config::load().timezone_offset_hours;
        (
            format!("daily:{}", daily_bucket(now, offset)),
            format!("monthly:{}", monthly_bucket(now, offset)),
        )
    }

    /// Record one completed request. `account_id` is the opaque id of the
    /// serving account (no provider prefix).
    pub async fn record_usage(
        &self,
        api_key_id: &str,
        account_id: &str,
        model: &str,
        delta: UsageDelta,
    ) -> StoreResult<f64> {
        let cost = pricing::cost_usd(
            model,
            delta.input_tokens,
            delta.output_tokens,
            delta.cache_create_tokens,
            delta.cache_read_tokens,
        );
        let now = Utc::now();
        let (daily, monthly) = self.windows(now);
        let windows = ["total".to_string(), daily, monthly];

        let key_subject = format!("key:{}", api_key_id);
        let subjects = [
            key_subject.clone(),
            format!("account:{}", account_id),
            format!("model:{}:{}", api_key_id, model),
        ];

        for window in &windows {
            for subject in &subjects {
                self.incr(&counter_key("tokens", window, subject), delta.total_tokens(), window)
                    .await?;
                self.incr(&counter_key("requests", window, subject), 1, window)
                    .await?;
                self.incr_float(&counter_key("cost", window, subject), cost, window)
                    .await?;
            }
            // Token-class detail is kept for the apiKey mirror only.
            self.incr(
                &counter_key("inputTokens", window, &key_subject),
                delta.input_tokens,
                window,
            )
            .await?;
            self.incr(
                &counter_key("outputTokens", window, &key_subject),
                delta.output_tokens,
                window,
            )
            .await?;
            self.incr(
                &counter_key("cacheCreateTokens", window, &key_subject),
                delta.cache_create_tokens,
                window,
            )
            .await?;
            self.incr(
                &counter_key("cacheReadTokens", window, &key_subject),
                delta.cache_read_tokens,
                window,
            )
            .await?;
        }

        crate::logger::debug(
            "usage",
            &format!(
                "Recorded usage: key={}, account={}, model={}, tokens={}, cost=${:.6}",
                api_key_id,
                account_id,
                model,
                delta.total_tokens(),
                cost
            ),
        );
        Ok(cost)
    }

    async fn incr(&self, key: &str, delta: i64, window: &str) -> StoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        self.store.incr_by(key, delta).await?;
        self.touch_ttl(key, window).await
    }

    async fn incr_float(&self, key: &str, delta: f64, window: &str) -> StoreResult<()> {
        if delta == 0.0 {
            return Ok(());
        }
        self.store.incr_by_float(key, delta).await?;
        self.touch_ttl(key, window).await
    }

    async fn touch_ttl(&self, key: &str, window: &str) -> StoreResult<()> {
        if window.starts_with("daily:") {
            self.store.expire(key, DAILY_TTL_SECS).await
        } else if window.starts_with("monthly:") {
            self.store.expire(key, MONTHLY_TTL_SECS).await
        } else {
            Ok(())
        }
    }

    async fn read_window(&self, window: &str, subject: &str) -> StoreResult<WindowUsage> {
        let keys: Vec<String> = [
            "tokens",
            "requests",
            "inputTokens",
            "outputTokens",
            "cacheCreateTokens",
            "cacheReadTokens",
            "cost",
        ]
        .iter()
        .map(|dim| counter_key(dim, window, subject))
        .collect();
        let values = self.store.mget(&keys).await?;
        let int = |idx: usize| -> i64 {
            values
                .get(idx)
                .and_then(|v| v.as_ref())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        let cost = values
            .get(6)
            .and_then(|v| v.as_ref())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        Ok(WindowUsage {
            tokens: int(0),
            requests: int(1),
            input_tokens: int(2),
            output_tokens: int(3),
            cache_create_tokens: int(4),
            cache_read_tokens: int(5),
            cost,
        })
    }

    /// Aggregated usage for one apiKey across the three windows.
    pub async fn key_usage(&self, api_key_id: &str) -> StoreResult<KeyUsage> {
        let now = Utc::now();
        let (daily, monthly) = self.windows(now);
        let subject = format!("key:{}", api_key_id);
        Ok(KeyUsage {
            total: self.read_window("total", &subject).await?,
            daily: self.read_window(&daily, &subject).await?,
            monthly: self.read_window(&monthly, &subject).await?,
        })
    }

    pub async fn total_tokens(&self, api_key_id: &str) -> StoreResult<i64> {
        let key = counter_key("tokens", "total", &format!("key:{}", api_key_id));
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn daily_cost(&self, api_key_id: &str) -> StoreResult<f64> {
        let now = Utc::now();
        let (daily, _) = self.windows(now);
        let key = counter_key("cost", &daily, &format!("key:{}", api_key_id));
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0))
    }

    // ------------------------------------------------------------------
    // Per-key sliding rate-limit window
    // ------------------------------------------------------------------

    fn window_key(api_key_id: &str) -> String {
        format!("ratelimit:window:{}", api_key_id)
    }

    /// Ensure the window anchor is current, resetting counters when the
    /// window has elapsed. The anchor advances in whole-minute buckets.
    /// Returns the counters valid for the current window.
    pub async fn current_window(
        &self,
        api_key_id: &str,
        window_minutes: i64,
    ) -> StoreResult<(i64, i64, f64)> {
        let key = Self::window_key(api_key_id);
        let hash = self.store.hget_all(&key).await?;
        let now_minute = Utc::now().timestamp() / 60;
        let window_start: i64 = hash
            .get("windowStart")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if window_start == 0 || now_minute - window_start >= window_minutes.max(1) {
            self.store
                .hset_map(
                    &key,
                    &[
                        ("windowStart".into(), now_minute.to_string()),
                        ("requests".into(), "0".into()),
                        ("tokens".into(), "0".into()),
                        ("cost".into(), "0".into()),
                    ],
                )
                .await?;
            return Ok((0, 0, 0.0));
        }

        let requests = hash.get("requests").and_then(|v| v.parse().ok()).unwrap_or(0);
        let tokens = hash.get("tokens").and_then(|v| v.parse().ok()).unwrap_or(0);
        let cost = hash.get("cost").and_then(|v| v.parse().ok()).unwrap_or(0.0);
        Ok((requests, tokens, cost))
    }

    pub async fn incr_window_requests(&self, api_key_id: &str) -> StoreResult<i64> {
        self.store
            .hincr_by(&Self::window_key(api_key_id), "requests", 1)
            .await
    }

    /// Apply observed usage to the sliding window after a successful call.
    /// Returns the window totals (logged, never returned to the client).
    pub async fn add_window_usage(
        &self,
        api_key_id: &str,
        window_minutes: i64,
        tokens: i64,
        cost: f64,
    ) -> StoreResult<(i64, f64)> {
        // Advance the anchor first so a long-running request does not write
        // into a stale window.
        self.current_window(api_key_id, window_minutes).await?;
        let key = Self::window_key(api_key_id);
        let total_tokens = self.store.hincr_by(&key, "tokens", tokens).await?;
        let total_cost = self.store.hincr_by_float(&key, "cost", cost).await?;
        Ok((total_tokens, total_cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_boundaries_follow_fixed_offset() {
        // 2026-03-01 17:00 UTC is already 2026-03-02 01:00 at UTC+8.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 17, 0, 0).unwrap();
        assert_eq!(daily_bucket(now, 8), "2026-03-02");
        assert_eq!(daily_bucket(now, 0), "2026-03-01");
        assert_eq!(monthly_bucket(now, 8), "2026-03");

        // Month boundary: 2026-03-31 20:00 UTC is April 1st at UTC+8.
        let eom = Utc.with_ymd_and_hms(2026, 3, 31, 20, 0, 0).unwrap();
        assert_eq!(monthly_bucket(eom, 8), "2026-04");
        assert_eq!(monthly_bucket(eom, 0), "2026-03");
    }

    #[test]
    fn delta_total_sums_all_classes() {
        let delta = UsageDelta {
            input_tokens: 10,
            output_tokens: 20,
            cache_create_tokens: 5,
            cache_read_tokens: 7,
        };
        assert_eq!(delta.total_tokens(), 42);
    }

    #[test]
    fn counter_key_layout() {
        assert_eq!(
            counter_key("tokens", "daily:2026-08-01", "key:k1"),
            "usage:tokens:daily:2026-08-01:key:k1"
        );
    }
}
