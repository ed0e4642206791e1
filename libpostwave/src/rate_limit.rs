//! Rate-limit tracking
//!
//! Platforms either report their quota in response headers or they don't. For
//! the first kind [`RateLimitInfo::from_headers`] reads the latest state; for
//! the second a [`RollingWindow`] counts our own calls in the database, bucketed
//! so the count survives restarts and is shared by concurrent handlers.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::error::Result;
use crate::store::PublishStore;

/// Quota state as of the most recent API interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitInfo {
    /// Parse `x-rate-limit-limit`, `x-rate-limit-remaining`, `x-rate-limit-reset`
    /// (reset is epoch seconds). Returns `None` unless remaining and reset are present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let remaining = header_u64(headers, "x-rate-limit-remaining")?;
        let reset = header_u64(headers, "x-rate-limit-reset")?;
        let reset_at = Utc.timestamp_opt(reset as i64, 0).single()?;

        Some(Self {
            limit: header_u64(headers, "x-rate-limit-limit").map(|l| l as u32),
            remaining: remaining.min(u32::MAX as u64) as u32,
            reset_at,
        })
    }

    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.remaining == 0 && self.reset_at > now
    }

    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        retry_after(self.reset_at, now)
    }
}

/// `max(0, reset_at - now)`.
pub fn retry_after(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (reset_at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Reset time for a 429 response: `x-rate-limit-reset`, then `retry-after`
/// (seconds), then `fallback` from now.
pub fn reset_from_headers(
    headers: &HeaderMap,
    now: DateTime<Utc>,
    fallback: Duration,
) -> DateTime<Utc> {
    if let Some(reset) = header_u64(headers, "x-rate-limit-reset")
        .and_then(|r| Utc.timestamp_opt(r as i64, 0).single())
    {
        return reset;
    }
    if let Some(secs) = header_u64(headers, "retry-after") {
        return now + chrono::Duration::seconds(secs as i64);
    }
    now + chrono::Duration::from_std(fallback).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Self-tracked quota for a platform without rate-limit headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub limit: u32,
    pub window: Duration,
}

/// A rolling call counter kept in the store, per (user, platform).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    user_id: String,
    platform: String,
    limit: WindowLimit,
}

impl RollingWindow {
    pub fn new(user_id: impl Into<String>, platform: impl Into<String>, limit: WindowLimit) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
            limit,
        }
    }

    fn window_secs(&self) -> i64 {
        self.limit.window.as_secs().max(1) as i64
    }

    /// Bucket width: a 24th of the window, so a daily window counts hourly.
    fn bucket_secs(&self) -> i64 {
        (self.window_secs() / 24).max(1)
    }

    fn bucket_start(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.bucket_secs())
    }

    /// Current usage as a [`RateLimitInfo`].
    pub async fn snapshot(&self, store: &dyn PublishStore, now: DateTime<Utc>) -> Result<RateLimitInfo> {
        let now_ts = now.timestamp();
        let since = self.bucket_start(now_ts - self.window_secs());
        let (used, oldest) = store.window_usage(&self.user_id, &self.platform, since).await?;

        // The oldest counted bucket leaves the window one bucket after it ages out.
        let reset_ts = oldest
            .map(|start| start + self.window_secs() + self.bucket_secs())
            .unwrap_or(now_ts);

        Ok(RateLimitInfo {
            limit: Some(self.limit.limit),
            remaining: self.limit.limit.saturating_sub(used),
            reset_at: Utc.timestamp_opt(reset_ts, 0).single().unwrap_or(now),
        })
    }

    /// Count one call at `now`.
    pub async fn record(&self, store: &dyn PublishStore, now: DateTime<Utc>) -> Result<()> {
        let bucket = self.bucket_start(now.timestamp());
        store
            .record_window_call(&self.user_id, &self.platform, bucket)
            .await
    }
}
