//! Failure classification
//!
//! Every failure in the publishing pipeline (transport error, non-2xx
//! response, image validation failure, quota breach) resolves to exactly one
//! [`PublishError`] variant. [`PublishError::classification`] turns that variant
//! into an [`ErrorClassification`] carrying retryability, the suggested delay
//! and the default inline retry budget for the error code.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quota::QuotaKind;

/// Delay assumed when a 429 response carries no usable `Retry-After` header.
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// Closed taxonomy of publishing failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("Network error: {0}")]
    Network(String),

    /// No connection was made, so the request never reached the platform
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {message}")]
    Auth { message: String, needs_reauth: bool },

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
        quota: Option<QuotaKind>,
    },

    #[error("Content rejected: {0}")]
    Content(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Image download failed: {0}")]
    ImageDownloadFailed(String),

    #[error("Image too large: {size} bytes exceeds limit of {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Image validation failed: {}", .0.join("; "))]
    ImageValidationFailed(Vec<String>),

    #[error("Media upload timed out: {0}")]
    UploadTimeout(String),

    #[error("Media registration failed: {0}")]
    MediaRegistrationFailed(String),

    #[error("Daily {quota} quota exhausted, resets in {}s", .retry_after.as_secs())]
    QuotaExceeded { quota: QuotaKind, retry_after: Duration },
}

/// Stable error codes persisted on publish attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    TimeoutError,
    AuthError,
    RateLimitError,
    ContentError,
    ServerError,
    ImageDownloadFailed,
    ImageTooLarge,
    UnsupportedFormat,
    ImageValidationFailed,
    UploadTimeout,
    MediaRegistrationFailed,
    QuotaExceeded,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::NetworkError,
        ErrorCode::TimeoutError,
        ErrorCode::AuthError,
        ErrorCode::RateLimitError,
        ErrorCode::ContentError,
        ErrorCode::ServerError,
        ErrorCode::ImageDownloadFailed,
        ErrorCode::ImageTooLarge,
        ErrorCode::UnsupportedFormat,
        ErrorCode::ImageValidationFailed,
        ErrorCode::UploadTimeout,
        ErrorCode::MediaRegistrationFailed,
        ErrorCode::QuotaExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::RateLimitError => "RATE_LIMIT_ERROR",
            ErrorCode::ContentError => "CONTENT_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ImageDownloadFailed => "IMAGE_DOWNLOAD_FAILED",
            ErrorCode::ImageTooLarge => "IMAGE_TOO_LARGE",
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::ImageValidationFailed => "IMAGE_VALIDATION_FAILED",
            ErrorCode::UploadTimeout => "UPLOAD_TIMEOUT",
            ErrorCode::MediaRegistrationFailed => "MEDIA_REGISTRATION_FAILED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
        }
    }

    /// Default inline retry budget: `(max_retries, base_delay)`.
    ///
    /// A rejected token is never retried inline; the caller refreshes it.
    pub fn default_retry(&self) -> (u32, Duration) {
        match self {
            ErrorCode::NetworkError => (3, Duration::from_secs(2)),
            ErrorCode::TimeoutError => (3, Duration::from_secs(5)),
            ErrorCode::AuthError => (0, Duration::ZERO),
            ErrorCode::RateLimitError => (3, Duration::from_secs(60)),
            ErrorCode::ContentError => (0, Duration::ZERO),
            ErrorCode::ServerError => (3, Duration::from_secs(10)),
            ErrorCode::ImageDownloadFailed => (2, Duration::from_secs(2)),
            ErrorCode::ImageTooLarge => (0, Duration::ZERO),
            ErrorCode::UnsupportedFormat => (0, Duration::ZERO),
            ErrorCode::ImageValidationFailed => (0, Duration::ZERO),
            ErrorCode::UploadTimeout => (2, Duration::from_secs(5)),
            ErrorCode::MediaRegistrationFailed => (2, Duration::from_secs(3)),
            ErrorCode::QuotaExceeded => (0, Duration::ZERO),
        }
    }

    /// Whether failures with this code concern only the accompanying image.
    pub fn is_image_specific(&self) -> bool {
        matches!(
            self,
            ErrorCode::ImageDownloadFailed
                | ErrorCode::ImageTooLarge
                | ErrorCode::UnsupportedFormat
                | ErrorCode::ImageValidationFailed
                | ErrorCode::UploadTimeout
                | ErrorCode::MediaRegistrationFailed
                | ErrorCode::QuotaExceeded
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .find(|code| code.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown error code: '{}'", s))
    }
}

/// What the caller should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry the same call after an exponential delay
    RetryWithBackoff,
    /// Wait for the platform-provided reset delay
    WaitForReset,
    /// Refresh the access token, then retry
    RefreshToken,
    /// Stored credentials are unusable; a human must re-authorise
    Reauthorize,
    /// Drop the image and publish text-only
    FallbackToTextOnly,
    /// The content itself was rejected; retrying will not help
    FixContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub code: ErrorCode,
    pub retryable: bool,
    /// Platform-provided delay (Retry-After, quota reset), when known
    pub suggested_delay: Option<Duration>,
    pub recovery: RecoveryStrategy,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl PublishError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PublishError::Network(_) | PublishError::Connect(_) => ErrorCode::NetworkError,
            PublishError::Timeout(_) => ErrorCode::TimeoutError,
            PublishError::Auth { .. } => ErrorCode::AuthError,
            PublishError::RateLimit { .. } => ErrorCode::RateLimitError,
            PublishError::Content(_) => ErrorCode::ContentError,
            PublishError::Server { .. } => ErrorCode::ServerError,
            PublishError::ImageDownloadFailed(_) => ErrorCode::ImageDownloadFailed,
            PublishError::ImageTooLarge { .. } => ErrorCode::ImageTooLarge,
            PublishError::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            PublishError::ImageValidationFailed(_) => ErrorCode::ImageValidationFailed,
            PublishError::UploadTimeout(_) => ErrorCode::UploadTimeout,
            PublishError::MediaRegistrationFailed(_) => ErrorCode::MediaRegistrationFailed,
            PublishError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
        }
    }

    pub fn is_image_error(&self) -> bool {
        self.code().is_image_specific()
    }

    pub fn needs_reauth(&self) -> bool {
        matches!(self, PublishError::Auth { needs_reauth: true, .. })
    }

    /// Whether the failure shows the platform did not act on the request,
    /// so sending it again cannot create a second post.
    ///
    /// A timeout, a reset mid-request or most 5xx responses leave that
    /// unknown.
    pub fn proves_not_accepted(&self) -> bool {
        match self {
            PublishError::Connect(_)
            | PublishError::RateLimit { .. }
            | PublishError::QuotaExceeded { .. } => true,
            PublishError::Server { status, .. } => *status == 503,
            _ => false,
        }
    }

    pub fn classification(&self) -> ErrorClassification {
        let code = self.code();
        let (max_retries, base_delay) = code.default_retry();

        let (retryable, suggested_delay, recovery) = match self {
            PublishError::Network(_) | PublishError::Connect(_) | PublishError::Timeout(_) => {
                (true, None, RecoveryStrategy::RetryWithBackoff)
            }
            PublishError::Auth { needs_reauth, .. } => {
                if *needs_reauth {
                    (false, None, RecoveryStrategy::Reauthorize)
                } else {
                    (true, None, RecoveryStrategy::RefreshToken)
                }
            }
            PublishError::RateLimit { retry_after, .. } => (
                true,
                Some(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_DELAY)),
                RecoveryStrategy::WaitForReset,
            ),
            PublishError::Content(_) => (false, None, RecoveryStrategy::FixContent),
            PublishError::Server { .. } => (true, None, RecoveryStrategy::RetryWithBackoff),
            PublishError::ImageDownloadFailed(_)
            | PublishError::UploadTimeout(_)
            | PublishError::MediaRegistrationFailed(_) => {
                (true, None, RecoveryStrategy::FallbackToTextOnly)
            }
            PublishError::ImageTooLarge { .. }
            | PublishError::UnsupportedFormat(_)
            | PublishError::ImageValidationFailed(_) => {
                (false, None, RecoveryStrategy::FallbackToTextOnly)
            }
            PublishError::QuotaExceeded { retry_after, .. } => (
                false,
                Some(*retry_after),
                RecoveryStrategy::FallbackToTextOnly,
            ),
        };

        ErrorClassification {
            code,
            retryable,
            suggested_delay,
            recovery,
            max_retries: if retryable { max_retries } else { 0 },
            base_delay,
        }
    }
}

/// The wire-protocol call a failure happened in.
///
/// The same HTTP status means different things depending on the call, e.g. a
/// 400 from asset registration is an image problem while a 400 from post
/// creation is a content problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCall {
    Profile,
    RegisterUpload,
    DownloadImage,
    UploadBinary,
    CreatePost,
    TokenExchange,
    TokenRefresh,
}

impl ApiCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiCall::Profile => "profile",
            ApiCall::RegisterUpload => "register upload",
            ApiCall::DownloadImage => "image download",
            ApiCall::UploadBinary => "binary upload",
            ApiCall::CreatePost => "post creation",
            ApiCall::TokenExchange => "token exchange",
            ApiCall::TokenRefresh => "token refresh",
        }
    }
}

/// OAuth error body (`{"error": "...", "error_description": "..."}`).
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Map a non-2xx response onto the taxonomy.
pub fn classify_status(
    call: ApiCall,
    status: StatusCode,
    retry_after: Option<&str>,
    body: &str,
) -> PublishError {
    let detail = summarize_body(body);
    let message = format!("{} returned {}: {}", call.as_str(), status.as_u16(), detail);

    if matches!(call, ApiCall::TokenExchange | ApiCall::TokenRefresh) {
        if let Some(err) = classify_oauth_error(status, body) {
            return err;
        }
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => PublishError::RateLimit {
            message,
            retry_after: retry_after.and_then(parse_retry_after),
            quota: None,
        },
        StatusCode::UNAUTHORIZED => PublishError::Auth {
            message,
            needs_reauth: false,
        },
        StatusCode::FORBIDDEN => PublishError::Auth {
            message,
            needs_reauth: true,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => match call {
            ApiCall::UploadBinary => PublishError::UploadTimeout(message),
            ApiCall::DownloadImage => PublishError::ImageDownloadFailed(message),
            _ => PublishError::Timeout(message),
        },
        StatusCode::PAYLOAD_TOO_LARGE if call == ApiCall::UploadBinary => {
            PublishError::ImageValidationFailed(vec![message])
        }
        s if s.is_server_error() => match call {
            ApiCall::RegisterUpload => PublishError::MediaRegistrationFailed(message),
            ApiCall::DownloadImage => PublishError::ImageDownloadFailed(message),
            _ => PublishError::Server {
                status: s.as_u16(),
                message,
            },
        },
        _ => match call {
            ApiCall::RegisterUpload => PublishError::MediaRegistrationFailed(message),
            ApiCall::DownloadImage | ApiCall::UploadBinary => {
                PublishError::ImageDownloadFailed(message)
            }
            ApiCall::TokenExchange | ApiCall::TokenRefresh => PublishError::Auth {
                message,
                needs_reauth: false,
            },
            ApiCall::Profile | ApiCall::CreatePost => PublishError::Content(message),
        },
    }
}

fn classify_oauth_error(status: StatusCode, body: &str) -> Option<PublishError> {
    let parsed: OAuthErrorBody = serde_json::from_str(body).ok()?;
    let description = parsed.error_description.unwrap_or_default();
    match parsed.error.as_str() {
        "invalid_grant" | "invalid_client" | "unauthorized_client" => Some(PublishError::Auth {
            message: format!("{} ({}): {}", parsed.error, status.as_u16(), description),
            needs_reauth: true,
        }),
        _ => None,
    }
}

/// Map a transport-level failure onto the taxonomy.
pub fn classify_transport(call: ApiCall, error: &reqwest::Error) -> PublishError {
    let message = format!("{} failed: {}", call.as_str(), error);

    if error.is_timeout() {
        return match call {
            ApiCall::UploadBinary => PublishError::UploadTimeout(message),
            ApiCall::DownloadImage => PublishError::ImageDownloadFailed(message),
            _ => PublishError::Timeout(message),
        };
    }

    if error.is_decode() {
        return match call {
            ApiCall::RegisterUpload => PublishError::MediaRegistrationFailed(message),
            _ => PublishError::Server {
                status: error.status().map(|s| s.as_u16()).unwrap_or(0),
                message,
            },
        };
    }

    match call {
        ApiCall::DownloadImage => PublishError::ImageDownloadFailed(message),
        _ if error.is_connect() => PublishError::Connect(message),
        _ => PublishError::Network(message),
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Keep error bodies short enough for the attempt record.
fn summarize_body(body: &str) -> String {
    const MAX: usize = 300;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    if trimmed.chars().count() <= MAX {
        return trimmed.to_string();
    }
    let mut short: String = trimmed.chars().take(MAX).collect();
    short.push_str("...");
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip_via_str() {
        for code in ErrorCode::ALL {
            assert_eq!(code.as_str().parse::<ErrorCode>().unwrap(), code);
        }
        assert!("NOT_A_CODE".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn test_image_specific_codes() {
        let image_codes: Vec<_> = ErrorCode::ALL
            .iter()
            .filter(|c| c.is_image_specific())
            .collect();
        assert_eq!(image_codes.len(), 7);
        assert!(!ErrorCode::NetworkError.is_image_specific());
        assert!(!ErrorCode::RateLimitError.is_image_specific());
    }

    #[test]
    fn test_classification_network_is_retryable() {
        let c = PublishError::Network("reset".into()).classification();
        assert_eq!(c.code, ErrorCode::NetworkError);
        assert!(c.retryable);
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.recovery, RecoveryStrategy::RetryWithBackoff);
    }

    #[test]
    fn test_rejected_token_has_no_inline_retries() {
        let c = PublishError::Auth {
            message: "401".into(),
            needs_reauth: false,
        }
        .classification();
        // still retryable as an attempt, once the token is refreshed
        assert!(c.retryable);
        assert_eq!(c.max_retries, 0);
        assert_eq!(c.recovery, RecoveryStrategy::RefreshToken);
    }

    #[test]
    fn test_connect_failure_is_a_network_error() {
        let c = PublishError::Connect("refused".into()).classification();
        assert_eq!(c.code, ErrorCode::NetworkError);
        assert!(c.retryable);
        assert_eq!(c.max_retries, 3);
    }

    #[test]
    fn test_proves_not_accepted() {
        assert!(PublishError::Connect("refused".into()).proves_not_accepted());
        assert!(PublishError::RateLimit {
            message: "429".into(),
            retry_after: None,
            quota: None,
        }
        .proves_not_accepted());
        assert!(PublishError::Server {
            status: 503,
            message: "unavailable".into(),
        }
        .proves_not_accepted());

        assert!(!PublishError::Timeout("slow".into()).proves_not_accepted());
        assert!(!PublishError::Network("reset".into()).proves_not_accepted());
        assert!(!PublishError::Server {
            status: 500,
            message: "oops".into(),
        }
        .proves_not_accepted());
    }

    #[test]
    fn test_classification_reauth_is_terminal() {
        let c = PublishError::Auth {
            message: "invalid_grant".into(),
            needs_reauth: true,
        }
        .classification();
        assert!(!c.retryable);
        assert_eq!(c.max_retries, 0);
        assert_eq!(c.recovery, RecoveryStrategy::Reauthorize);
    }

    #[test]
    fn test_classification_rate_limit_carries_delay() {
        let c = PublishError::RateLimit {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(120)),
            quota: None,
        }
        .classification();
        assert!(c.retryable);
        assert_eq!(c.suggested_delay, Some(Duration::from_secs(120)));
        assert_eq!(c.recovery, RecoveryStrategy::WaitForReset);
    }

    #[test]
    fn test_classification_rate_limit_default_delay() {
        let c = PublishError::RateLimit {
            message: "slow down".into(),
            retry_after: None,
            quota: None,
        }
        .classification();
        assert_eq!(c.suggested_delay, Some(DEFAULT_RATE_LIMIT_DELAY));
    }

    #[test]
    fn test_classification_content_not_retryable() {
        let c = PublishError::Content("duplicate".into()).classification();
        assert!(!c.retryable);
        assert_eq!(c.recovery, RecoveryStrategy::FixContent);
    }

    #[test]
    fn test_classification_quota_falls_back() {
        let c = PublishError::QuotaExceeded {
            quota: QuotaKind::MediaUploads,
            retry_after: Duration::from_secs(3600),
        }
        .classification();
        assert!(!c.retryable);
        assert_eq!(c.recovery, RecoveryStrategy::FallbackToTextOnly);
        assert_eq!(c.suggested_delay, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_classify_status_429_with_retry_after() {
        let err = classify_status(
            ApiCall::CreatePost,
            StatusCode::TOO_MANY_REQUESTS,
            Some("120"),
            "",
        );
        match err {
            PublishError::RateLimit { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(120)));
            }
            other => panic!("Expected RateLimit, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_status_401_and_403() {
        let unauthorized = classify_status(ApiCall::Profile, StatusCode::UNAUTHORIZED, None, "");
        assert!(matches!(
            unauthorized,
            PublishError::Auth {
                needs_reauth: false,
                ..
            }
        ));

        let forbidden = classify_status(ApiCall::CreatePost, StatusCode::FORBIDDEN, None, "");
        assert!(forbidden.needs_reauth());
    }

    #[test]
    fn test_classify_status_depends_on_call() {
        let register = classify_status(
            ApiCall::RegisterUpload,
            StatusCode::BAD_REQUEST,
            None,
            "{}",
        );
        assert!(matches!(register, PublishError::MediaRegistrationFailed(_)));

        let post = classify_status(ApiCall::CreatePost, StatusCode::UNPROCESSABLE_ENTITY, None, "{}");
        assert!(matches!(post, PublishError::Content(_)));

        let server = classify_status(ApiCall::CreatePost, StatusCode::BAD_GATEWAY, None, "");
        assert!(matches!(server, PublishError::Server { status: 502, .. }));
    }

    #[test]
    fn test_classify_status_oauth_invalid_grant() {
        let err = classify_status(
            ApiCall::TokenRefresh,
            StatusCode::BAD_REQUEST,
            None,
            r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#,
        );
        assert!(err.needs_reauth());
        assert!(err.to_string().contains("refresh token revoked"));
    }

    #[test]
    fn test_classify_status_oauth_server_error_is_transient() {
        let err = classify_status(ApiCall::TokenRefresh, StatusCode::SERVICE_UNAVAILABLE, None, "");
        assert!(matches!(err, PublishError::Server { status: 503, .. }));
        assert!(err.classification().retryable);
    }

    #[test]
    fn test_parse_retry_after_variants() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_summarize_body_truncates() {
        let long = "x".repeat(1000);
        let summary = summarize_body(&long);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), 303);
        assert_eq!(summarize_body("   "), "<empty body>");
    }

    #[test]
    fn test_image_validation_failed_message_joins_issues() {
        let err = PublishError::ImageValidationFailed(vec![
            "width 100 below minimum 200".into(),
            "height 100 below minimum 200".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "Image validation failed: width 100 below minimum 200; height 100 below minimum 200"
        );
    }
}
