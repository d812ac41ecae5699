//! Core types for Syndicast

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::classify::ErrorCode;

/// Overall status of a publish attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Retrying => "retrying",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "retrying" => Some(AttemptStatus::Retrying),
            "success" => Some(AttemptStatus::Success),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }

    /// Success and Failed accept no further transitions (Failed only leaves
    /// via an explicit reset).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Success | AttemptStatus::Failed)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image sub-status, tracked independently of the overall attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageStatus {
    /// The content has no image, or the pipeline is disabled
    Skipped,
    Pending,
    Success,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Skipped => "skipped",
            ImageStatus::Pending => "pending",
            ImageStatus::Success => "success",
            ImageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skipped" => Some(ImageStatus::Skipped),
            "pending" => Some(ImageStatus::Pending),
            "success" => Some(ImageStatus::Success),
            "failed" => Some(ImageStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-content publish attempt record
///
/// One record exists per content item. Records are never deleted; they are
/// the audit trail of everything that happened while publishing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishAttempt {
    /// Database row ID (None for new records)
    pub id: Option<i64>,
    pub content_id: String,
    pub status: AttemptStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub remote_post_id: Option<String>,
    pub remote_post_url: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub image_status: ImageStatus,
    /// Asset URNs attached to the published post
    pub media_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl PublishAttempt {
    /// Create a new pending attempt
    pub fn new(content_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            id: None,
            content_id: content_id.into(),
            status: AttemptStatus::Pending,
            attempt_count: 0,
            max_attempts,
            remote_post_id: None,
            remote_post_url: None,
            error_message: None,
            error_code: None,
            next_retry_at: None,
            image_status: ImageStatus::Pending,
            media_ids: Vec::new(),
            created_at: Utc::now(),
            last_attempt_at: None,
            posted_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

/// OAuth credential for the target platform
///
/// At most one credential is active system-wide. Secrets are held in
/// [`SecretString`] so they are zeroed on drop and redacted from `Debug`.
#[derive(Debug)]
pub struct PublishCredential {
    /// Database row ID (None for new records)
    pub id: Option<i64>,
    pub client_id: String,
    pub client_secret: SecretString,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Incremented on every token write; used for compare-and-swap updates
    pub version: i64,
}

impl PublishCredential {
    /// Create a new active credential with no tokens yet
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            id: None,
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            access_token: None,
            refresh_token: None,
            expires_at: None,
            is_active: true,
            version: 0,
        }
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token
            .as_ref()
            .map(|t| !t.expose_secret().is_empty())
            .unwrap_or(false)
    }
}

impl Clone for PublishCredential {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            client_id: self.client_id.clone(),
            client_secret: clone_secret(&self.client_secret),
            access_token: self.access_token.as_ref().map(clone_secret),
            refresh_token: self.refresh_token.as_ref().map(clone_secret),
            expires_at: self.expires_at,
            is_active: self.is_active,
            version: self.version,
        }
    }
}

pub(crate) fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

/// Token values written after a successful exchange or refresh
#[derive(Debug)]
pub struct TokenUpdate {
    pub access_token: SecretString,
    /// None keeps the currently stored refresh token
    pub refresh_token: Option<SecretString>,
    pub expires_at: DateTime<Utc>,
}

/// Supported image formats
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Bmp,
    Tiff,
}

impl ImageFormat {
    /// Formats the target platform accepts for feed images
    pub const PLATFORM_ALLOWED: [ImageFormat; 3] =
        [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Gif];

    /// Parse MIME type from a MIME string (e.g., "image/jpeg")
    pub fn from_mime_str(s: &str) -> Option<Self> {
        let essence = s.split(';').next().unwrap_or("").trim().to_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::WebP),
            "image/bmp" => Some(Self::Bmp),
            "image/tiff" => Some(Self::Tiff),
            _ => None,
        }
    }

    pub fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::Gif => Some(Self::Gif),
            image::ImageFormat::WebP => Some(Self::WebP),
            image::ImageFormat::Bmp => Some(Self::Bmp),
            image::ImageFormat::Tiff => Some(Self::Tiff),
            _ => None,
        }
    }

    pub fn as_mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
        }
    }

    pub fn is_platform_allowed(&self) -> bool {
        Self::PLATFORM_ALLOWED.contains(self)
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// Where an image candidate came from, in priority order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageSourceKind {
    Social,
    Featured,
    MediaItem,
}

/// An image that might accompany the post
///
/// Dimensions, format, size and transparency are unknown until the image
/// has been fetched and probed.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCandidate {
    pub url: String,
    /// 0 is the most preferred candidate
    pub priority: u32,
    pub source: ImageSourceKind,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<ImageFormat>,
    pub file_size_bytes: Option<u64>,
    pub has_transparency: Option<bool>,
}

impl ImageCandidate {
    pub fn new(url: impl Into<String>, priority: u32, source: ImageSourceKind) -> Self {
        Self {
            url: url.into(),
            priority,
            source,
            width: None,
            height: None,
            format: None,
            file_size_bytes: None,
            has_transparency: None,
        }
    }
}

/// Post text produced by the content formatter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedContent {
    pub title: String,
    /// Full share commentary (title, excerpt, URL, hashtags)
    pub body: String,
    pub url: String,
    pub hashtags: Vec<String>,
    /// Length of `body` in characters
    pub character_count: usize,
}
