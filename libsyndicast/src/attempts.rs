//! Publish attempt state machine
//!
//! ```text
//! Pending  --success-->                       Success   (terminal)
//! Pending  --retryable failure, count < max--> Retrying
//! Retrying --success-->                       Success
//! Retrying --retryable failure, count < max--> Retrying
//! *        --otherwise-->                      Failed    (terminal until reset)
//! Failed   --reset-->                          Pending
//! ```
//!
//! The transition functions operate on a [`PublishAttempt`] in memory;
//! [`AttemptTracker`] loads, transitions and saves through an
//! [`AttemptRepository`].
//!
//! Before any network call a worker claims the attempt with a lease. Only
//! one worker holds a lease at a time; saving the outcome releases it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::classify::PublishError;
use crate::error::{Result, SyndicastError};
use crate::types::{AttemptStatus, ImageStatus, PublishAttempt};

/// Longest backoff exponent; 2^10 minutes is already over 17 hours
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// How long a claim keeps other workers away from an attempt
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(15 * 60);

/// Storage for publish attempts, one per content item
#[async_trait]
pub trait AttemptRepository: Send + Sync {
    async fn get(&self, content_id: &str) -> Result<Option<PublishAttempt>>;

    /// Insert or update the attempt for `attempt.content_id`, releasing any
    /// claim on it. Returns the attempt with its id assigned.
    async fn save(&self, attempt: &PublishAttempt) -> Result<PublishAttempt>;

    /// Unclaimed `Retrying` attempts whose `next_retry_at` has passed
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<PublishAttempt>>;

    /// Atomically claim the attempt for `content_id` until `lease_until`,
    /// creating it as `Pending` on first use.
    ///
    /// Only a `Pending` attempt, or a `Retrying` one that is due, can be
    /// claimed, and only while no unexpired lease is held on it. Returns
    /// `None` when the claim is refused.
    async fn claim(
        &self,
        content_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<PublishAttempt>>;

    /// Drop the claim without changing the attempt
    async fn release(&self, content_id: &str) -> Result<()>;
}

/// Result of [`AttemptTracker::claim`]
#[derive(Debug, Clone)]
pub enum Claim {
    /// The caller holds the lease and may publish
    Acquired(PublishAttempt),
    /// Terminal, not yet due, or being published by another worker
    Busy(PublishAttempt),
}

/// What a successful publish produced
#[derive(Debug, Clone)]
pub struct PublishSuccess {
    pub remote_post_id: String,
    pub remote_post_url: String,
    pub image_status: ImageStatus,
    pub media_ids: Vec<String>,
    /// Why the image was dropped, when the post fell back to text-only
    pub image_error: Option<PublishError>,
}

/// Attempt-level backoff: `2^attempt_count` minutes
pub fn backoff_delay(attempt_count: u32) -> Duration {
    let exponent = attempt_count.min(MAX_BACKOFF_EXPONENT);
    Duration::from_secs(60 * 2_u64.pow(exponent))
}

/// Apply a successful publish to `attempt`
pub fn apply_success(
    attempt: &mut PublishAttempt,
    success: &PublishSuccess,
    now: DateTime<Utc>,
) -> Result<()> {
    if attempt.status.is_terminal() {
        return Err(SyndicastError::InvalidTransition(format!(
            "{} -> success for '{}'",
            attempt.status, attempt.content_id
        )));
    }
    if success.remote_post_id.trim().is_empty() {
        return Err(SyndicastError::InvalidTransition(format!(
            "success without a remote post id for '{}'",
            attempt.content_id
        )));
    }

    attempt.status = AttemptStatus::Success;
    attempt.attempt_count = (attempt.attempt_count + 1).min(attempt.max_attempts);
    attempt.remote_post_id = Some(success.remote_post_id.clone());
    attempt.remote_post_url = Some(success.remote_post_url.clone());
    attempt.image_status = success.image_status;
    attempt.media_ids = success.media_ids.clone();
    attempt.error_code = success.image_error.as_ref().map(PublishError::code);
    attempt.error_message = success.image_error.as_ref().map(ToString::to_string);
    attempt.next_retry_at = None;
    attempt.last_attempt_at = Some(now);
    attempt.posted_at = Some(now);
    Ok(())
}

/// Apply a failed publish to `attempt`, choosing between `Retrying` and
/// `Failed`.
///
/// A platform-suggested delay (Retry-After, quota reset) takes precedence
/// over the exponential backoff.
pub fn apply_failure(
    attempt: &mut PublishAttempt,
    error: &PublishError,
    image_status: ImageStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    if attempt.status.is_terminal() {
        return Err(SyndicastError::InvalidTransition(format!(
            "{} -> failure for '{}'",
            attempt.status, attempt.content_id
        )));
    }

    let classification = error.classification();
    attempt.attempt_count = (attempt.attempt_count + 1).min(attempt.max_attempts);
    attempt.error_code = Some(classification.code);
    attempt.error_message = Some(error.to_string());
    attempt.image_status = image_status;
    attempt.last_attempt_at = Some(now);

    if classification.retryable && attempt.attempt_count < attempt.max_attempts {
        let delay = classification
            .suggested_delay
            .unwrap_or_else(|| backoff_delay(attempt.attempt_count))
            .max(Duration::from_secs(1));
        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::minutes(1));
        attempt.status = AttemptStatus::Retrying;
        attempt.next_retry_at = Some(now + delay);
    } else {
        attempt.status = AttemptStatus::Failed;
        attempt.next_retry_at = None;
    }
    Ok(())
}

/// Drives attempts through the state machine and persists every transition
#[derive(Clone)]
pub struct AttemptTracker {
    repo: Arc<dyn AttemptRepository>,
    max_attempts: u32,
    lease: Duration,
}

impl AttemptTracker {
    pub fn new(repo: Arc<dyn AttemptRepository>, max_attempts: u32) -> Self {
        Self {
            repo,
            max_attempts,
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Override the claim lease; it should outlast a whole publish
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub async fn get(&self, content_id: &str) -> Result<Option<PublishAttempt>> {
        self.repo.get(content_id).await
    }

    /// Claim the attempt for `content_id`, creating it as `Pending` on first
    /// use. A refused claim hands back the attempt as it currently stands.
    pub async fn claim(&self, content_id: &str) -> Result<Claim> {
        if content_id.trim().is_empty() {
            return Err(SyndicastError::InvalidInput("content id is empty".to_string()));
        }

        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(self.lease)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));

        match self
            .repo
            .claim(content_id, self.max_attempts, now, lease_until)
            .await?
        {
            Some(attempt) => Ok(Claim::Acquired(attempt)),
            None => self.load(content_id).await.map(Claim::Busy),
        }
    }

    /// Give up a claim without recording an outcome
    pub async fn release(&self, content_id: &str) -> Result<()> {
        self.repo.release(content_id).await
    }

    pub async fn record_success(
        &self,
        content_id: &str,
        success: &PublishSuccess,
    ) -> Result<PublishAttempt> {
        let mut attempt = self.load(content_id).await?;
        apply_success(&mut attempt, success, Utc::now())?;

        info!(
            content_id,
            remote_post_id = %success.remote_post_id,
            image_status = %success.image_status,
            attempt = attempt.attempt_count,
            "Publish succeeded"
        );
        self.repo.save(&attempt).await
    }

    pub async fn record_failure(
        &self,
        content_id: &str,
        error: &PublishError,
        image_status: ImageStatus,
    ) -> Result<PublishAttempt> {
        let mut attempt = self.load(content_id).await?;
        apply_failure(&mut attempt, error, image_status, Utc::now())?;

        match attempt.next_retry_at {
            Some(next) => warn!(
                content_id,
                code = %error.code(),
                attempt = attempt.attempt_count,
                max_attempts = attempt.max_attempts,
                next_retry_at = %next,
                "Publish failed, retry scheduled: {}",
                error
            ),
            None => warn!(
                content_id,
                code = %error.code(),
                attempt = attempt.attempt_count,
                "Publish failed permanently: {}",
                error
            ),
        }
        self.repo.save(&attempt).await
    }

    /// Move a `Failed` attempt back to `Pending` so it can be reprocessed
    pub async fn reset(&self, content_id: &str) -> Result<PublishAttempt> {
        let mut attempt = self.load(content_id).await?;
        if attempt.status != AttemptStatus::Failed {
            return Err(SyndicastError::InvalidTransition(format!(
                "only failed attempts can be reset; '{}' is {}",
                content_id, attempt.status
            )));
        }

        attempt.status = AttemptStatus::Pending;
        attempt.attempt_count = 0;
        attempt.error_code = None;
        attempt.error_message = None;
        attempt.next_retry_at = None;
        attempt.image_status = ImageStatus::Pending;

        info!(content_id, "Attempt reset to pending");
        self.repo.save(&attempt).await
    }

    /// Attempts whose scheduled retry is due
    pub async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<PublishAttempt>> {
        self.repo.list_due(now).await
    }

    async fn load(&self, content_id: &str) -> Result<PublishAttempt> {
        self.repo.get(content_id).await?.ok_or_else(|| {
            SyndicastError::InvalidInput(format!("no publish attempt for '{}'", content_id))
        })
    }
}

/// In-process attempt repository
#[derive(Debug, Default)]
pub struct MemoryAttemptRepository {
    inner: Mutex<MemoryAttempts>,
}

#[derive(Debug, Default)]
struct MemoryAttempts {
    by_content: HashMap<String, PublishAttempt>,
    claims: HashMap<String, DateTime<Utc>>,
    next_id: i64,
}

impl MemoryAttempts {
    fn is_claimed(&self, content_id: &str, now: DateTime<Utc>) -> bool {
        self.claims
            .get(content_id)
            .map(|until| *until > now)
            .unwrap_or(false)
    }
}

impl MemoryAttemptRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptRepository for MemoryAttemptRepository {
    async fn get(&self, content_id: &str) -> Result<Option<PublishAttempt>> {
        Ok(self.inner.lock().await.by_content.get(content_id).cloned())
    }

    async fn save(&self, attempt: &PublishAttempt) -> Result<PublishAttempt> {
        let mut inner = self.inner.lock().await;
        let id = match inner.by_content.get(&attempt.content_id).and_then(|a| a.id) {
            Some(id) => id,
            None => {
                inner.next_id += 1;
                inner.next_id
            }
        };

        let mut stored = attempt.clone();
        stored.id = Some(id);
        inner
            .by_content
            .insert(stored.content_id.clone(), stored.clone());
        inner.claims.remove(&stored.content_id);
        Ok(stored)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<PublishAttempt>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<PublishAttempt> = inner
            .by_content
            .values()
            .filter(|a| a.status == AttemptStatus::Retrying)
            .filter(|a| a.next_retry_at.map(|at| at <= now).unwrap_or(false))
            .filter(|a| !inner.is_claimed(&a.content_id, now))
            .cloned()
            .collect();
        due.sort_by_key(|a| a.next_retry_at);
        Ok(due)
    }

    async fn claim(
        &self,
        content_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<PublishAttempt>> {
        let mut inner = self.inner.lock().await;

        let attempt = match inner.by_content.get(content_id) {
            Some(existing) => existing.clone(),
            None => {
                inner.next_id += 1;
                let mut created = PublishAttempt::new(content_id, max_attempts);
                created.id = Some(inner.next_id);
                created.created_at = now;
                inner
                    .by_content
                    .insert(content_id.to_string(), created.clone());
                created
            }
        };

        let runnable = match attempt.status {
            AttemptStatus::Pending => true,
            AttemptStatus::Retrying => attempt.next_retry_at.map(|at| at <= now).unwrap_or(false),
            AttemptStatus::Success | AttemptStatus::Failed => false,
        };
        if !runnable || inner.is_claimed(content_id, now) {
            return Ok(None);
        }

        inner.claims.insert(content_id.to_string(), lease_until);
        Ok(Some(attempt))
    }

    async fn release(&self, content_id: &str) -> Result<()> {
        self.inner.lock().await.claims.remove(content_id);
        Ok(())
    }
}
