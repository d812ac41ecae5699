//! Daily platform quotas
//!
//! The platform caps posts and media uploads per day. Counters live behind
//! the [`QuotaCounter`] trait so that every worker shares one count; the
//! SQLite [`Database`](crate::db::Database) is the shared implementation and
//! [`MemoryQuotaCounter`] covers single-process use and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

/// Counters expire one day after the end of their window
const WINDOW_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    Posts,
    MediaUploads,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::Posts => "posts",
            QuotaKind::MediaUploads => "media_uploads",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared counter store: atomic increment with expiry.
#[async_trait]
pub trait QuotaCounter: Send + Sync {
    /// Increment `key`, creating it with the given expiry if absent.
    /// Returns the count after the increment.
    async fn increment(&self, key: &str, expires_at: DateTime<Utc>) -> Result<u64>;

    /// Current count for `key` (0 if absent or expired)
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<u64>;

    /// Remove counters that expired before `now`. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// In-process counter store
#[derive(Debug, Default)]
pub struct MemoryQuotaCounter {
    counters: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
}

impl MemoryQuotaCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaCounter for MemoryQuotaCounter {
    async fn increment(&self, key: &str, expires_at: DateTime<Utc>) -> Result<u64> {
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(key.to_string()).or_insert((0, expires_at));
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<u64> {
        let counters = self.counters.lock().await;
        Ok(counters
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(count, _)| *count)
            .unwrap_or(0))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - counters.len()) as u64)
    }
}

/// Configured daily limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub posts_per_day: u32,
    pub uploads_per_day: u32,
}

impl QuotaLimits {
    pub fn limit_for(&self, kind: QuotaKind) -> u32 {
        match kind {
            QuotaKind::Posts => self.posts_per_day,
            QuotaKind::MediaUploads => self.uploads_per_day,
        }
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            posts_per_day: 150,
            uploads_per_day: 150,
        }
    }
}

/// Daily quota tracker over a shared counter store
#[derive(Clone)]
pub struct DailyQuota {
    counter: Arc<dyn QuotaCounter>,
    limits: QuotaLimits,
}

impl DailyQuota {
    pub fn new(counter: Arc<dyn QuotaCounter>, limits: QuotaLimits) -> Self {
        Self { counter, limits }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Take one call of this kind out of today's allowance.
    ///
    /// The shared counter is incremented before it is compared with the
    /// limit, so workers racing for the last slot cannot all win. Returns
    /// `Ok(None)` when the call may go ahead, or `Ok(Some(reset_in))` with the
    /// time until the next UTC day when the quota is exhausted.
    ///
    /// A reservation is kept even if the call then fails; the platform
    /// counts rejected requests too.
    pub async fn reserve(&self, kind: QuotaKind, now: DateTime<Utc>) -> Result<Option<Duration>> {
        let used = self.record(kind, now).await?;

        if used <= u64::from(self.limits.limit_for(kind)) {
            Ok(None)
        } else {
            Ok(Some(until_next_utc_day(now)))
        }
    }

    /// Count one call of this kind. Returns today's count.
    pub async fn record(&self, kind: QuotaKind, now: DateTime<Utc>) -> Result<u64> {
        let key = quota_key(kind, now.date_naive());
        let expires_at = now + chrono::Duration::from_std(until_next_utc_day(now) + WINDOW_GRACE)
            .unwrap_or_else(|_| chrono::Duration::days(2));
        self.counter.increment(&key, expires_at).await
    }

    /// Calls of this kind still available today
    pub async fn remaining(&self, kind: QuotaKind, now: DateTime<Utc>) -> Result<u32> {
        let key = quota_key(kind, now.date_naive());
        let used = self.counter.get(&key, now).await?;
        let limit = u64::from(self.limits.limit_for(kind));
        Ok(limit.saturating_sub(used) as u32)
    }

    /// Drop expired counter windows
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.counter.purge_expired(now).await
    }
}

/// Counter key for a quota window, e.g. `quota:posts:2024-03-01`
pub fn quota_key(kind: QuotaKind, day: NaiveDate) -> String {
    format!("quota:{}:{}", kind.as_str(), day.format("%Y-%m-%d"))
}

/// Time remaining until the next UTC midnight
pub fn until_next_utc_day(now: DateTime<Utc>) -> Duration {
    let next_midnight = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());

    match next_midnight {
        Some(midnight) => (midnight - now).to_std().unwrap_or(Duration::ZERO),
        None => Duration::ZERO,
    }
}
