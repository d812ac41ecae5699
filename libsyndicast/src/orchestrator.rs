//! One publish operation, end to end
//!
//! [`PublishingOrchestrator::publish`] formats the content, picks an image,
//! makes sure the token is valid and then tries the image post. When anything
//! about the image fails the same attempt carries on as a text-only post, so
//! an image problem alone never keeps a post from going out.
//!
//! Publish failures never leave this module as errors; they are recorded on
//! the returned [`PublishAttempt`]. Only storage and configuration problems
//! are returned as `Err`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::{debug, info, instrument, warn};

use crate::attempts::{AttemptTracker, Claim, PublishSuccess};
use crate::classify::PublishError;
use crate::config::Config;
use crate::content::Postable;
use crate::db::Database;
use crate::error::{Result, SyndicastError};
use crate::formatter::ContentFormatter;
use crate::images::{ImagePipeline, PreparedImage};
use crate::platform::{CreatedPost, Profile, PublishingClient};
use crate::queue::TaskQueue;
use crate::quota::DailyQuota;
use crate::retry::{retry_with_backoff, retry_with_backoff_if, RetryPolicy};
use crate::token::TokenManager;
use crate::types::{AttemptStatus, FormattedContent, ImageStatus, PublishAttempt};

/// Where in the image path a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaStage {
    Register,
    Upload,
    CreatePost,
}

enum Outcome {
    Published(PublishSuccess),
    Failed {
        error: PublishError,
        image_status: ImageStatus,
    },
}

pub struct PublishingOrchestrator {
    tracker: AttemptTracker,
    tokens: Arc<TokenManager>,
    client: Arc<PublishingClient>,
    images: ImagePipeline,
    formatter: ContentFormatter,
    queue: Arc<dyn TaskQueue>,
    retry: RetryPolicy,
}

impl PublishingOrchestrator {
    pub fn new(
        tracker: AttemptTracker,
        tokens: Arc<TokenManager>,
        client: Arc<PublishingClient>,
        images: ImagePipeline,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            tracker,
            tokens,
            client,
            images,
            formatter: ContentFormatter::default(),
            queue,
            retry: RetryPolicy::default(),
        }
    }

    /// Wire every component to one shared database
    pub fn from_config(config: &Config, db: Arc<Database>) -> Result<Self> {
        let quota = DailyQuota::new(db.clone(), config.quotas.limits());
        let client = Arc::new(PublishingClient::new(
            &config.platform,
            config.images.max_bytes,
            quota,
        )?);
        let tokens = Arc::new(TokenManager::new(
            db.clone(),
            &config.platform,
            &config.publishing,
        )?);
        let retry = RetryPolicy::new(config.publishing.max_inline_delay);
        let images =
            ImagePipeline::new(client.clone(), &config.images).with_retry_policy(retry.clone());
        let tracker = AttemptTracker::new(db.clone(), config.publishing.max_attempts);

        Ok(Self::new(tracker, tokens, client, images, db).with_retry_policy(retry))
    }

    pub fn with_formatter(mut self, formatter: ContentFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Policy for inline retries of single platform calls
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tracker(&self) -> &AttemptTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Post text as it would be published, without touching the network
    pub fn preview(&self, content: &dyn Postable, with_image: bool) -> FormattedContent {
        self.formatter.format(content, with_image)
    }

    /// Publish `content` once.
    ///
    /// The attempt is claimed before any network call, so concurrent callers
    /// for the same content never both post. A caller whose claim is refused
    /// gets the attempt as it currently stands: already published, failed
    /// until reset, not yet due, or in flight elsewhere.
    #[instrument(skip(self, content), fields(content_id = content.content_id()))]
    pub async fn publish(&self, content: &dyn Postable) -> Result<PublishAttempt> {
        let content_id = content.content_id();
        let attempt = match self.tracker.claim(content_id).await? {
            Claim::Acquired(attempt) => attempt,
            Claim::Busy(attempt) => {
                match attempt.status {
                    AttemptStatus::Success => debug!(content_id, "Already published"),
                    AttemptStatus::Failed => {
                        info!(content_id, "Attempt failed permanently; reset it to publish again")
                    }
                    AttemptStatus::Pending | AttemptStatus::Retrying => {
                        debug!(content_id, "Attempt is in flight or not yet due")
                    }
                }
                return Ok(attempt);
            }
        };

        info!(
            content_id,
            attempt = attempt.attempt_count + 1,
            max_attempts = attempt.max_attempts,
            "Publishing"
        );

        let outcome = match self.run(content).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(release_err) = self.tracker.release(content_id).await {
                    warn!(content_id, "Failed to release claim: {}", release_err);
                }
                return Err(e);
            }
        };

        match outcome {
            Outcome::Published(success) => self.tracker.record_success(content_id, &success).await,
            Outcome::Failed {
                error,
                image_status,
            } => {
                let attempt = self
                    .tracker
                    .record_failure(content_id, &error, image_status)
                    .await?;
                if let Some(next) = attempt.next_retry_at {
                    self.schedule_retry(content_id, next).await;
                }
                Ok(attempt)
            }
        }
    }

    async fn run(&self, content: &dyn Postable) -> Result<Outcome> {
        let image = self.images.select_best_compatible(content).await;
        let mut image_status = match &image {
            Some(_) => ImageStatus::Pending,
            None if self.images.is_enabled()
                && !self.images.select_candidates(content).is_empty() =>
            {
                ImageStatus::Failed
            }
            None => ImageStatus::Skipped,
        };

        let mut token = match self.tokens.ensure_valid().await {
            Ok(token) => token,
            Err(SyndicastError::Publish(error)) => {
                return Ok(Outcome::Failed {
                    error,
                    image_status,
                })
            }
            Err(other) => return Err(other),
        };

        let profile = match self.fetch_profile(&mut token).await? {
            Ok(profile) => profile,
            Err(error) => {
                return Ok(Outcome::Failed {
                    error,
                    image_status,
                })
            }
        };

        let mut image_error = None;
        if let Some(prepared) = image {
            let formatted = self.formatter.format(content, true);
            match self
                .publish_with_image(&token, &profile, &formatted, &prepared)
                .await
            {
                Ok((post, asset_urn)) => {
                    return Ok(Outcome::Published(PublishSuccess {
                        remote_post_id: post.id,
                        remote_post_url: post.url,
                        image_status: ImageStatus::Success,
                        media_ids: vec![asset_urn],
                        image_error: None,
                    }))
                }
                Err((stage, error)) if falls_back(stage, &error) => {
                    warn!(
                        content_id = content.content_id(),
                        stage = ?stage,
                        code = %error.code(),
                        "Image post failed, falling back to text-only: {}",
                        error
                    );
                    image_status = ImageStatus::Failed;
                    image_error = Some(error);
                }
                Err((_, error)) => {
                    return Ok(Outcome::Failed {
                        error,
                        image_status,
                    })
                }
            }
        }

        let formatted = self.formatter.format(content, false);
        let author = profile.author_urn.as_str();
        let token = &token;
        let posted = retry_with_backoff_if(
            &self.retry,
            "create post",
            PublishError::proves_not_accepted,
            || self.client.create_post(token, author, &formatted, None),
        )
        .await;

        Ok(match posted {
            Ok(post) => Outcome::Published(PublishSuccess {
                remote_post_id: post.id,
                remote_post_url: post.url,
                image_status,
                media_ids: Vec::new(),
                image_error,
            }),
            Err(error) => Outcome::Failed {
                error,
                image_status,
            },
        })
    }

    /// Profile lookup, refreshing the token once if the platform rejects it
    async fn fetch_profile(
        &self,
        token: &mut SecretString,
    ) -> Result<std::result::Result<Profile, PublishError>> {
        let first = {
            let current: &SecretString = token;
            retry_with_backoff(&self.retry, "get profile", || {
                self.client.get_profile(current)
            })
            .await
        };

        match first {
            Err(PublishError::Auth {
                needs_reauth: false,
                ..
            }) => {}
            other => return Ok(other),
        }

        let refreshed = match self.tokens.refresh_rejected(token).await {
            Ok(refreshed) => refreshed,
            Err(SyndicastError::Publish(error)) => return Ok(Err(error)),
            Err(other) => return Err(other),
        };
        *token = refreshed;

        let current: &SecretString = token;
        Ok(retry_with_backoff(&self.retry, "get profile", || {
            self.client.get_profile(current)
        })
        .await)
    }

    async fn publish_with_image(
        &self,
        token: &SecretString,
        profile: &Profile,
        formatted: &FormattedContent,
        prepared: &PreparedImage,
    ) -> std::result::Result<(CreatedPost, String), (MediaStage, PublishError)> {
        let author = profile.author_urn.as_str();

        let upload = retry_with_backoff(&self.retry, "register upload", || {
            self.client.register_media_upload(token, author)
        })
        .await
        .map_err(|e| (MediaStage::Register, e))?;

        retry_with_backoff(&self.retry, "upload image", || {
            self.client.upload_binary(&upload.upload_url, &prepared.bytes)
        })
        .await
        .map_err(|e| (MediaStage::Upload, e))?;

        // The post may exist after a timeout, so only failures that show it
        // was never created are retried here; the rest wait for the next
        // attempt.
        let asset = upload.asset_urn.as_str();
        let post = retry_with_backoff_if(
            &self.retry,
            "create image post",
            PublishError::proves_not_accepted,
            || self.client.create_post(token, author, formatted, Some(asset)),
        )
        .await
        .map_err(|e| (MediaStage::CreatePost, e))?;

        Ok((post, upload.asset_urn))
    }

    async fn schedule_retry(&self, content_id: &str, next: DateTime<Utc>) {
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        match self.queue.enqueue_delayed(content_id, delay).await {
            Ok(()) => debug!(content_id, delay_ms = delay.as_millis() as u64, "Retry enqueued"),
            Err(e) => warn!(
                content_id,
                "Could not enqueue retry, leaving it to the due-retry sweep: {}", e
            ),
        }
    }
}

/// Whether a failure on the image path should degrade to a text-only post.
///
/// Before the post exists anything but an auth failure is the image's fault.
/// Once the post itself is being created only image-specific errors are.
fn falls_back(stage: MediaStage, error: &PublishError) -> bool {
    match stage {
        MediaStage::Register | MediaStage::Upload => !matches!(error, PublishError::Auth { .. }),
        MediaStage::CreatePost => error.is_image_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaKind;

    #[test]
    fn test_media_stage_falls_back_on_transport_errors() {
        let network = PublishError::Network("reset".to_string());
        assert!(falls_back(MediaStage::Register, &network));
        assert!(falls_back(MediaStage::Upload, &network));
        assert!(!falls_back(MediaStage::CreatePost, &network));
    }

    #[test]
    fn test_auth_never_falls_back() {
        let auth = PublishError::Auth {
            message: "401".to_string(),
            needs_reauth: false,
        };
        assert!(!falls_back(MediaStage::Register, &auth));
        assert!(!falls_back(MediaStage::Upload, &auth));
        assert!(!falls_back(MediaStage::CreatePost, &auth));
    }

    #[test]
    fn test_upload_quota_falls_back_but_post_quota_does_not() {
        let uploads = PublishError::QuotaExceeded {
            quota: QuotaKind::MediaUploads,
            retry_after: Duration::from_secs(3600),
        };
        assert!(falls_back(MediaStage::Register, &uploads));

        let posts = PublishError::RateLimit {
            message: "daily post quota exhausted".to_string(),
            retry_after: Some(Duration::from_secs(3600)),
            quota: Some(QuotaKind::Posts),
        };
        assert!(!falls_back(MediaStage::CreatePost, &posts));
    }

    #[test]
    fn test_image_errors_at_post_creation_fall_back() {
        let invalid = PublishError::ImageValidationFailed(vec!["asset not ready".to_string()]);
        assert!(falls_back(MediaStage::CreatePost, &invalid));
    }
}
