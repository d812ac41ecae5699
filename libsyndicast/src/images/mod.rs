//! Image pipeline
//!
//! Picks the image that accompanies a post. Candidates are tried in priority
//! order; the first one that downloads, validates and (optionally) survives
//! processing wins. `None` from [`ImagePipeline::select_best_compatible`]
//! means the post goes out text-only.

pub mod process;
pub mod select;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::classify::PublishError;
use crate::config::ImageConfig;
use crate::content::Postable;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::types::ImageCandidate;

pub use process::{process_image, ProcessOptions};
pub use select::select_candidates;
pub use validate::{
    probe, validate_candidate, ImageLimits, ProbedImage, ValidationIssue, ValidationReport,
    ValidationWarning,
};

/// Raw bytes of a downloaded image
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Downloads candidate images
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<FetchedImage, PublishError>;
}

/// An image ready for upload
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Candidate with the facts of the bytes below filled in
    pub candidate: ImageCandidate,
    pub bytes: Vec<u8>,
    /// Cached copy of processed bytes, when a work directory is configured
    pub path: Option<PathBuf>,
    pub warnings: Vec<ValidationWarning>,
    pub processed: bool,
}

pub struct ImagePipeline {
    fetcher: Arc<dyn ImageFetcher>,
    enabled: bool,
    limits: ImageLimits,
    process: Option<ProcessOptions>,
    work_dir: Option<PathBuf>,
    retry: RetryPolicy,
}

impl ImagePipeline {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, config: &ImageConfig) -> Self {
        Self {
            fetcher,
            enabled: config.enabled,
            limits: ImageLimits::from(config),
            process: config.process.then(|| ProcessOptions::from(config)),
            work_dir: config.process.then(|| config.resolve_work_dir()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Keep processed images in memory only
    pub fn without_cache(mut self) -> Self {
        self.work_dir = None;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limits(&self) -> &ImageLimits {
        &self.limits
    }

    /// Candidates for `content`, most preferred first
    pub fn select_candidates(&self, content: &dyn Postable) -> Vec<ImageCandidate> {
        select_candidates(content.image_sources())
    }

    /// Download and validate a candidate, filling in its probed facts.
    ///
    /// Returns the report and, when the download succeeded, the bytes.
    pub async fn validate(
        &self,
        candidate: &mut ImageCandidate,
    ) -> (ValidationReport, Option<Vec<u8>>) {
        let url = candidate.url.clone();
        let fetched = retry_with_backoff(&self.retry, "image download", || {
            self.fetcher.fetch_image(&url)
        })
        .await;

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => return (validate::download_failure(&e), None),
        };

        match probe(&fetched.bytes) {
            Ok(probed) => probed.apply_to(candidate),
            Err(e) => return (validate::download_failure(&e), Some(fetched.bytes)),
        }

        (validate_candidate(candidate, &self.limits), Some(fetched.bytes))
    }

    /// Flatten, resize and re-encode validated bytes, then validate the result
    pub async fn process(
        &self,
        candidate: &ImageCandidate,
        bytes: Vec<u8>,
    ) -> Result<PreparedImage, PublishError> {
        let options = self.process.unwrap_or_default();

        let processed = tokio::task::spawn_blocking(move || process_image(&bytes, &options))
            .await
            .map_err(|e| {
                PublishError::ImageValidationFailed(vec![format!("processing task failed: {}", e)])
            })??;

        let mut result = candidate.clone();
        probe(&processed)?.apply_to(&mut result);

        let report = validate_candidate(&result, &self.limits);
        if let Some(err) = report.to_error() {
            return Err(err);
        }

        let path = match &self.work_dir {
            Some(dir) => match process::store_processed(dir, &processed).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(dir = %dir.display(), "Could not cache processed image: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(PreparedImage {
            candidate: result,
            bytes: processed,
            path,
            warnings: report.warnings,
            processed: true,
        })
    }

    /// First candidate that validates (and processes), or `None` to publish
    /// text-only.
    pub async fn select_best_compatible(&self, content: &dyn Postable) -> Option<PreparedImage> {
        if !self.enabled {
            debug!(content_id = content.content_id(), "Image pipeline disabled");
            return None;
        }

        let candidates = self.select_candidates(content);
        if candidates.is_empty() {
            debug!(content_id = content.content_id(), "No image candidates");
            return None;
        }

        for mut candidate in candidates {
            let (report, bytes) = self.validate(&mut candidate).await;

            for warning in &report.warnings {
                warn!(
                    content_id = content.content_id(),
                    url = %candidate.url,
                    "Image warning: {}",
                    warning
                );
            }

            let bytes = match (report.is_ok(), bytes) {
                (true, Some(bytes)) => bytes,
                _ => {
                    let reasons: Vec<String> =
                        report.issues.iter().map(ToString::to_string).collect();
                    info!(
                        content_id = content.content_id(),
                        url = %candidate.url,
                        priority = candidate.priority,
                        "Skipping image candidate: {}",
                        reasons.join("; ")
                    );
                    continue;
                }
            };

            if self.process.is_none() {
                return Some(PreparedImage {
                    candidate,
                    bytes,
                    path: None,
                    warnings: report.warnings,
                    processed: false,
                });
            }

            match self.process(&candidate, bytes).await {
                Ok(prepared) => {
                    info!(
                        content_id = content.content_id(),
                        url = %candidate.url,
                        width = prepared.candidate.width,
                        height = prepared.candidate.height,
                        bytes = prepared.bytes.len(),
                        "Selected image"
                    );
                    return Some(prepared);
                }
                Err(e) => {
                    info!(
                        content_id = content.content_id(),
                        url = %candidate.url,
                        "Image processing failed: {}",
                        e
                    );
                }
            }
        }

        info!(
            content_id = content.content_id(),
            "No compatible image, publishing text-only"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{BlogPost, ImageSources};
    use image::{Rgb, RgbImage};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubFetcher {
        images: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
            self.images.insert(url.to_string(), bytes);
            self
        }
    }

    #[async_trait]
    impl ImageFetcher for StubFetcher {
        async fn fetch_image(&self, url: &str) -> Result<FetchedImage, PublishError> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.images.get(url) {
                Some(bytes) => Ok(FetchedImage {
                    bytes: bytes.clone(),
                    content_type: Some("image/jpeg".to_string()),
                }),
                None => Err(PublishError::ImageDownloadFailed(format!("404 for {}", url))),
            }
        }
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 120, 120]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn post_with(images: ImageSources) -> BlogPost {
        BlogPost {
            id: "p1".to_string(),
            title: "T".to_string(),
            excerpt: None,
            body_html: "<p>b</p>".to_string(),
            url: "https://blog.example.com/p1".to_string(),
            tags: Vec::new(),
            images,
        }
    }

    fn pipeline(fetcher: Arc<StubFetcher>, process: bool) -> ImagePipeline {
        let config = ImageConfig {
            process,
            ..ImageConfig::default()
        };
        ImagePipeline::new(fetcher, &config)
            .with_retry_policy(RetryPolicy::immediate())
            .without_cache()
    }

    #[tokio::test]
    async fn test_first_valid_candidate_wins() {
        let fetcher = Arc::new(
            StubFetcher::default()
                .with("https://cdn.example.com/small.jpg", jpeg(100, 100))
                .with("https://cdn.example.com/good.jpg", jpeg(1200, 627)),
        );
        let post = post_with(ImageSources {
            social: Some("https://cdn.example.com/small.jpg".to_string()),
            featured: Some("https://cdn.example.com/good.jpg".to_string()),
            media: Vec::new(),
        });

        let prepared = pipeline(fetcher, true).select_best_compatible(&post).await.unwrap();
        assert_eq!(prepared.candidate.url, "https://cdn.example.com/good.jpg");
        assert_eq!(prepared.candidate.width, Some(1200));
        assert_eq!(prepared.candidate.height, Some(627));
        assert!(prepared.processed);
    }

    #[tokio::test]
    async fn test_none_when_all_candidates_fail() {
        let fetcher = Arc::new(
            StubFetcher::default().with("https://cdn.example.com/small.jpg", jpeg(100, 100)),
        );
        let post = post_with(ImageSources {
            social: Some("https://cdn.example.com/small.jpg".to_string()),
            featured: Some("https://cdn.example.com/missing.jpg".to_string()),
            media: Vec::new(),
        });

        assert!(pipeline(fetcher.clone(), true).select_best_compatible(&post).await.is_none());
        // missing image: one call plus two inline retries
        let calls = fetcher.calls.lock().unwrap();
        assert_eq!(
            calls.iter().filter(|u| u.ends_with("missing.jpg")).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_unprocessed_candidate_keeps_original_bytes() {
        let original = jpeg(800, 600);
        let fetcher = Arc::new(
            StubFetcher::default().with("https://cdn.example.com/a.jpg", original.clone()),
        );
        let post = post_with(ImageSources {
            featured: Some("https://cdn.example.com/a.jpg".to_string()),
            ..Default::default()
        });

        let prepared = pipeline(fetcher, false).select_best_compatible(&post).await.unwrap();
        assert!(!prepared.processed);
        assert_eq!(prepared.bytes, original);
    }

    #[tokio::test]
    async fn test_disabled_pipeline_skips_fetching() {
        let fetcher = Arc::new(
            StubFetcher::default().with("https://cdn.example.com/a.jpg", jpeg(800, 600)),
        );
        let config = ImageConfig {
            enabled: false,
            ..ImageConfig::default()
        };
        let post = post_with(ImageSources {
            social: Some("https://cdn.example.com/a.jpg".to_string()),
            ..Default::default()
        });

        let pipeline = ImagePipeline::new(fetcher.clone(), &config);
        assert!(pipeline.select_best_compatible(&post).await.is_none());
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validate_fills_candidate_facts() {
        let fetcher = Arc::new(
            StubFetcher::default().with("https://cdn.example.com/a.jpg", jpeg(1200, 627)),
        );
        let mut candidate = ImageCandidate::new(
            "https://cdn.example.com/a.jpg",
            0,
            crate::types::ImageSourceKind::Social,
        );

        let (report, bytes) = pipeline(fetcher, true).validate(&mut candidate).await;
        assert!(report.is_ok());
        assert!(bytes.is_some());
        assert_eq!(candidate.format, Some(crate::types::ImageFormat::Jpeg));
        assert_eq!(candidate.has_transparency, Some(false));
        assert!(candidate.file_size_bytes.unwrap() > 0);
    }
}
