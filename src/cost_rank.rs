//! Cost-rank index
//!
//! Pre-computed leaderboards of apiKey spend, one sorted set per window
//! (today / 7days / 30days / all). A refresh builds the ranking into a
//! temporary sorted set and swaps it onto the canonical key with RENAME,
//! so readers never observe a partially built index. Only one refresh per
//! window runs at a time, guarded by a store lock.

use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use uuid::Uuid;

use crate::config;
use crate::store::{Store, StoreError, StoreResult};
use crate::usage;

const LOCK_TTL_SECS: u64 = 300;
const BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankWindow {
    Today,
    SevenDays,
    ThirtyDays,
    All,
}

impl RankWindow {
    pub const ALL: [RankWindow; 4] = [
        RankWindow::Today,
        RankWindow::SevenDays,
        RankWindow::ThirtyDays,
        RankWindow::All,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RankWindow::Today => "today",
            RankWindow::SevenDays => "7days",
            RankWindow::ThirtyDays => "30days",
            RankWindow::All => "all",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "today" => Some(RankWindow::Today),
            "7days" => Some(RankWindow::SevenDays),
            "30days" => Some(RankWindow::ThirtyDays),
            "all" => Some(RankWindow::All),
            _ => None,
        }
    }

    /// Background refresh cadence.
    pub fn refresh_interval(&self) -> Duration {
        match self {
            RankWindow::Today => Duration::from_secs(10 * 60),
            RankWindow::SevenDays => Duration::from_secs(30 * 60),
            RankWindow::ThirtyDays => Duration::from_secs(60 * 60),
            RankWindow::All => Duration::from_secs(2 * 60 * 60),
        }
    }

    fn day_span(&self) -> Option<i64> {
        match self {
            RankWindow::Today => Some(1),
            RankWindow::SevenDays => Some(7),
            RankWindow::ThirtyDays => Some(30),
            RankWindow::All => None,
        }
    }
}

fn rank_key(window: RankWindow) -> String {
    format!("cost_rank:{}", window.as_str())
}

fn temp_key(window: RankWindow) -> String {
    format!("cost_rank:{}:updating", window.as_str())
}

fn meta_key(window: RankWindow) -> String {
    format!("cost_rank_meta:{}", window.as_str())
}

fn lock_key(window: RankWindow) -> String {
    format!("cost_rank_lock:{}", window.as_str())
}

/// Daily bucket names for the last `days` days, today included.
fn recent_daily_buckets(days: i64) -> Vec<String> {
    let offset = config::load().timezone_offset_hours;
    let now = Utc::now();
    (0..days)
        .map(|back| usage::daily_bucket(now - ChronoDuration::days(back), offset))
        .collect()
}

#[derive(Clone)]
pub struct CostRankService {
    store: Store,
}

impl CostRankService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Rebuild one window's leaderboard. Skipped (Ok) when another refresh
    /// holds the lock.
    pub async fn refresh(&self, window: RankWindow) -> StoreResult<()> {
        let lock = lock_key(window);
        let token = Uuid::new_v4().to_string();
        if !self.store.set_nx_ex(&lock, &token, LOCK_TTL_SECS).await? {
            crate::logger::debug(
                "cost_rank",
                &format!("Refresh already in progress, skipping: window={}", window.as_str()),
            );
            return Ok(());
        }

        let started = Instant::now();
        self.store
            .hset(&meta_key(window), "status", "updating")
            .await?;

        let result = self.rebuild(window).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(key_count) => {
                self.store
                    .hset_map(
                        &meta_key(window),
                        &[
                            ("lastUpdate".into(), Utc::now().to_rfc3339()),
                            ("keyCount".into(), key_count.to_string()),
                            ("status".into(), "ready".into()),
                            ("updateDuration".into(), elapsed_ms.to_string()),
                        ],
                    )
                    .await?;
                crate::logger::info(
                    "cost_rank",
                    &format!(
                        "Refreshed: window={}, keys={}, took={}ms",
                        window.as_str(),
                        key_count,
                        elapsed_ms
                    ),
                );
            }
            Err(ref e) => {
                crate::logger::error(
                    "cost_rank",
                    &format!("Refresh failed: window={}, error={}", window.as_str(), e),
                );
                let _ = self.store.hset(&meta_key(window), "status", "failed").await;
                let _ = self.store.del(&temp_key(window)).await;
            }
        }

        self.store.del(&lock).await?;
        result.map(|_| ())
    }

    async fn rebuild(&self, window: RankWindow) -> StoreResult<usize> {
        let ids = self.store.smembers("apikeys").await?;
        if ids.is_empty() {
            // Nothing to rank; drop any stale index.
            self.store.del(&rank_key(window)).await?;
            return Ok(0);
        }

        let temp = temp_key(window);
        // A previous failed run may have left the temp key behind.
        self.store.del(&temp).await?;

        for batch in ids.chunks(BATCH_SIZE) {
            let costs = self.window_costs(window, batch).await?;
            let entries: Vec<(f64, String)> = batch
                .iter()
                .zip(costs)
                .map(|(id, cost)| (cost, id.clone()))
                .collect();
            self.store.zadd_multi(&temp, &entries).await?;
        }

        self.store.rename(&temp, &rank_key(window)).await?;
        Ok(ids.len())
    }

    /// Cumulative cost per key for one window, in batch order.
    async fn window_costs(&self, window: RankWindow, ids: &[String]) -> StoreResult<Vec<f64>> {
        match window.day_span() {
            None => {
                let keys: Vec<String> = ids
                    .iter()
                    .map(|id| format!("usage:cost:total:key:{}", id))
                    .collect();
                let values = self.store.mget(&keys).await?;
                Ok(values
                    .into_iter()
                    .map(|v| v.and_then(|v| v.parse().ok()).unwrap_or(0.0))
                    .collect())
            }
            Some(days) => {
                let mut sums = vec![0.0f64; ids.len()];
                for bucket in recent_daily_buckets(days) {
                    let keys: Vec<String> = ids
                        .iter()
                        .map(|id| format!("usage:cost:daily:{}:key:{}", bucket, id))
                        .collect();
                    let values = self.store.mget(&keys).await?;
                    for (sum, value) in sums.iter_mut().zip(values) {
                        *sum += value.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
                    }
                }
                Ok(sums)
            }
        }
    }

    /// Incremental hooks keep the index membership exact between refreshes.
    pub async fn on_key_created(&self, api_key_id: &str) -> StoreResult<()> {
        for window in RankWindow::ALL {
            self.store.zadd(&rank_key(window), 0.0, api_key_id).await?;
        }
        Ok(())
    }

    pub async fn on_key_deleted(&self, api_key_id: &str) -> StoreResult<()> {
        for window in RankWindow::ALL {
            self.store.zrem(&rank_key(window), api_key_id).await?;
        }
        Ok(())
    }

    /// Top spenders, highest first.
    pub async fn top(&self, window: RankWindow, limit: i64) -> StoreResult<Vec<(String, f64)>> {
        self.store
            .zrevrange_with_scores(&rank_key(window), 0, limit.max(1) - 1)
            .await
    }

    /// On-demand ranking over an arbitrary date range. Not indexed;
    /// computed by summing daily cost keys per apiKey in batches.
    pub async fn custom_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<(String, f64)>> {
        if end < start {
            return Err(StoreError::Command("end date before start date".to_string()));
        }
        let buckets: Vec<String> = {
            let mut days = Vec::new();
            let mut cursor = start;
            while cursor <= end {
                days.push(cursor.format("%Y-%m-%d").to_string());
                cursor = cursor + ChronoDuration::days(1);
            }
            days
        };

        let ids = self.store.smembers("apikeys").await?;
        let mut ranked: Vec<(String, f64)> = Vec::with_capacity(ids.len());
        for batch in ids.chunks(BATCH_SIZE) {
            let mut sums = vec![0.0f64; batch.len()];
            for bucket in &buckets {
                let keys: Vec<String> = batch
                    .iter()
                    .map(|id| format!("usage:cost:daily:{}:key:{}", bucket, id))
                    .collect();
                let values = self.store.mget(&keys).await?;
                for (sum, value) in sums.iter_mut().zip(values) {
                    *sum += value.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
                }
            }
            ranked.extend(batch.iter().cloned().zip(sums));
        }
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked)
    }

    /// Spawn the background refresh timers. Each timer swallows its own
    /// errors; a failed refresh never takes the process down.
    pub fn spawn_timers(&self) {
        for window in RankWindow::ALL {
            let service = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(window.refresh_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = service.refresh(window).await {
                        crate::logger::error(
                            "cost_rank",
                            &format!(
                                "Background refresh error: window={}, error={}",
                                window.as_str(),
                                e
                            ),
                        );
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_names_round_trip() {
        for window in RankWindow::ALL {
            assert_eq!(RankWindow::from_str(window.as_str()), Some(window));
        }
        assert_eq!(RankWindow::from_str("weekly"), None);
    }

    #[test]
    fn refresh_cadence_ordering() {
        assert!(RankWindow::Today.refresh_interval() < RankWindow::SevenDays.refresh_interval());
        assert!(
            RankWindow::ThirtyDays.refresh_interval() < RankWindow::All.refresh_interval()
        );
    }

    #[test]
    fn key_layout() {
        assert_eq!(rank_key(RankWindow::SevenDays), "cost_rank:7days");
        assert_eq!(temp_key(RankWindow::Today), "cost_rank:today:updating");
        assert_eq!(meta_key(RankWindow::All), "cost_rank_meta:all");
        assert_eq!(lock_key(RankWindow::ThirtyDays), "cost_rank_lock:30days");
    }
}
