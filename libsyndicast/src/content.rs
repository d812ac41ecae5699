//! Content items fed into the pipeline
//!
//! The pipeline only reads content through the [`Postable`] trait, so the same
//! formatter and image selection work for stored blog posts and for
//! synthetic previews that were never persisted.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyndicastError};

/// A media item attached to the content body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub url: String,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub order: i32,
}

/// Image sources in the order the publisher prefers them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSources {
    /// Image made specifically for social sharing
    #[serde(default)]
    pub social: Option<String>,
    /// The post's featured/hero image
    #[serde(default)]
    pub featured: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaItem>,
}

impl ImageSources {
    pub const fn empty() -> Self {
        Self {
            social: None,
            featured: None,
            media: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.social.is_none() && self.featured.is_none() && self.media.is_empty()
    }
}

static NO_IMAGES: ImageSources = ImageSources::empty();

/// Read-only view of a content item
pub trait Postable: Send + Sync {
    /// Stable identifier; one publish attempt exists per id
    fn content_id(&self) -> &str;
    fn title(&self) -> &str;
    /// Explicit summary, if the author wrote one
    fn excerpt(&self) -> Option<&str>;
    /// Body as HTML
    fn body(&self) -> &str;
    /// Absolute URL of the published item
    fn url(&self) -> &str;
    fn tags(&self) -> &[String];

    fn image_sources(&self) -> &ImageSources {
        &NO_IMAGES
    }
}

/// A stored blog post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogPost {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub excerpt: Option<String>,
    pub body_html: String,
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub images: ImageSources,
}

impl BlogPost {
    /// Check the fields the pipeline depends on
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyndicastError::InvalidInput("content id is empty".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(SyndicastError::InvalidInput(format!(
                "content '{}' has an empty title",
                self.id
            )));
        }
        let parsed = url::Url::parse(&self.url).map_err(|e| {
            SyndicastError::InvalidInput(format!(
                "content '{}' has an invalid url '{}': {}",
                self.id, self.url, e
            ))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SyndicastError::InvalidInput(format!(
                "content '{}' url must be http(s), got '{}'",
                self.id,
                parsed.scheme()
            )));
        }
        Ok(())
    }
}

impl Postable for BlogPost {
    fn content_id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn excerpt(&self) -> Option<&str> {
        self.excerpt.as_deref().filter(|e| !e.trim().is_empty())
    }

    fn body(&self) -> &str {
        &self.body_html
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn image_sources(&self) -> &ImageSources {
        &self.images
    }
}

/// Unsaved content, used to preview how a draft would be formatted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewPost {
    pub title: String,
    pub excerpt: Option<String>,
    pub body: String,
    pub url: String,
    pub tags: Vec<String>,
}

impl PreviewPost {
    pub fn new(title: impl Into<String>, body: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = Some(excerpt.into());
        self
    }
}

impl Postable for PreviewPost {
    fn content_id(&self) -> &str {
        "preview"
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn excerpt(&self) -> Option<&str> {
        self.excerpt.as_deref()
    }

    fn body(&self) -> &str {
        &self.body
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }
}

/// Where the daemon loads content items from
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Load a content item, or `None` if it no longer exists
    async fn load(&self, content_id: &str) -> Result<Option<BlogPost>>;
}

/// Content items stored as `<dir>/<content_id>.json`
#[derive(Debug, Clone)]
pub struct JsonDirectorySource {
    dir: PathBuf,
}

impl JsonDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, content_id: &str) -> Result<PathBuf> {
        let safe = !content_id.is_empty()
            && content_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !content_id.starts_with('.');
        if !safe {
            return Err(SyndicastError::InvalidInput(format!(
                "invalid content id '{}'",
                content_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", content_id)))
    }
}

#[async_trait]
impl ContentSource for JsonDirectorySource {
    async fn load(&self, content_id: &str) -> Result<Option<BlogPost>> {
        let path = self.path_for(content_id)?;

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(crate::error::DbError::IoError(e).into()),
        };

        let post: BlogPost = serde_json::from_str(&raw).map_err(|e| {
            SyndicastError::InvalidInput(format!("{}: {}", path.display(), e))
        })?;

        if post.id != content_id {
            return Err(SyndicastError::InvalidInput(format!(
                "{} declares id '{}' but was loaded as '{}'",
                path.display(),
                post.id,
                content_id
            )));
        }
        post.validate()?;

        Ok(Some(post))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn sample_post(id: &str) -> BlogPost {
        BlogPost {
            id: id.to_string(),
            title: "Shipping a Rust daemon".to_string(),
            excerpt: None,
            body_html: "<p>We rewrote the scheduler.</p><p>It is faster now.</p>".to_string(),
            url: format!("https://blog.example.com/posts/{}", id),
            tags: vec!["rust".to_string(), "systems programming".to_string()],
            images: ImageSources::default(),
        }
    }

    #[test]
    fn test_blog_post_validate() {
        assert!(sample_post("a1").validate().is_ok());

        let mut relative = sample_post("a1");
        relative.url = "/posts/a1".to_string();
        assert!(matches!(
            relative.validate(),
            Err(SyndicastError::InvalidInput(_))
        ));

        let mut ftp = sample_post("a1");
        ftp.url = "ftp://example.com/a1".to_string();
        assert!(ftp.validate().is_err());
    }

    #[test]
    fn test_blank_excerpt_is_none() {
        let mut post = sample_post("a1");
        post.excerpt = Some("   ".to_string());
        assert_eq!(post.excerpt(), None);
    }

    #[test]
    fn test_preview_has_no_images() {
        let preview = PreviewPost::new("Draft", "<p>body</p>", "https://example.com/d")
            .with_tags(["draft"]);
        assert!(preview.image_sources().is_empty());
        assert_eq!(preview.tags(), ["draft".to_string()]);
    }

    #[tokio::test]
    async fn test_json_directory_source_load() {
        let temp_dir = TempDir::new().unwrap();
        let post = sample_post("post-1");
        std::fs::write(
            temp_dir.path().join("post-1.json"),
            serde_json::to_string(&post).unwrap(),
        )
        .unwrap();

        let source = JsonDirectorySource::new(temp_dir.path());
        let loaded = source.load("post-1").await.unwrap();
        assert_eq!(loaded, Some(post));
    }

    #[tokio::test]
    async fn test_json_directory_source_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let source = JsonDirectorySource::new(temp_dir.path());
        assert_eq!(source.load("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_directory_source_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let source = JsonDirectorySource::new(temp_dir.path());
        assert!(matches!(
            source.load("../etc/passwd").await,
            Err(SyndicastError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_json_directory_source_id_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("post-2.json"),
            serde_json::to_string(&sample_post("post-3")).unwrap(),
        )
        .unwrap();

        let source = JsonDirectorySource::new(temp_dir.path());
        assert!(source.load("post-2").await.is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let post: BlogPost = serde_json::from_str(
            r#"{"id":"x","title":"T","body_html":"<p>b</p>","url":"https://e.com/x"}"#,
        )
        .unwrap();
        assert!(post.tags.is_empty());
        assert!(post.images.is_empty());
        assert!(post.excerpt.is_none());
    }
}
