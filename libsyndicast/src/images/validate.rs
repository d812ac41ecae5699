//! Image probing and validation
//!
//! Hard failures (format, minimum size, byte size, unreadable data) reject a
//! candidate. Oversized dimensions and unusual aspect ratios are only warnings:
//! the platform accepts them and processing can bring them into range.

use std::fmt;
use std::io::Cursor;

use image::{ImageDecoder, ImageReader};

use crate::classify::PublishError;
use crate::config::ImageConfig;
use crate::types::{ImageCandidate, ImageFormat};

/// Widest landscape ratio accepted without a warning (1.91:1)
pub const MAX_ASPECT_RATIO: f64 = 1.91;
/// Tallest portrait ratio accepted without a warning (1:1.91)
pub const MIN_ASPECT_RATIO: f64 = 1.0 / 1.91;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageLimits {
    pub min_width: u32,
    pub min_height: u32,
    pub warn_max_width: u32,
    pub warn_max_height: u32,
    pub max_bytes: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self::from(&ImageConfig::default())
    }
}

impl From<&ImageConfig> for ImageLimits {
    fn from(config: &ImageConfig) -> Self {
        Self {
            min_width: config.min_width,
            min_height: config.min_height,
            warn_max_width: config.warn_max_width,
            warn_max_height: config.warn_max_height,
            max_bytes: config.max_bytes,
        }
    }
}

/// A reason to reject a candidate
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationIssue {
    UnsupportedFormat(String),
    TooSmall {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },
    TooLarge { size: u64, limit: u64 },
    Unreadable(String),
    DownloadFailed(String),
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::UnsupportedFormat(format) => {
                write!(f, "unsupported format {}", format)
            }
            ValidationIssue::TooSmall {
                width,
                height,
                min_width,
                min_height,
            } => write!(
                f,
                "dimensions {}x{} below minimum {}x{}",
                width, height, min_width, min_height
            ),
            ValidationIssue::TooLarge { size, limit } => {
                write!(f, "file size {} bytes exceeds limit of {} bytes", size, limit)
            }
            ValidationIssue::Unreadable(reason) => write!(f, "unreadable image: {}", reason),
            ValidationIssue::DownloadFailed(reason) => write!(f, "download failed: {}", reason),
        }
    }
}

/// A property the platform tolerates but that is worth logging
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    OversizedDimensions {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    AspectRatio(f64),
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::OversizedDimensions {
                width,
                height,
                max_width,
                max_height,
            } => write!(
                f,
                "dimensions {}x{} exceed recommended {}x{}",
                width, height, max_width, max_height
            ),
            ValidationWarning::AspectRatio(ratio) => write!(
                f,
                "aspect ratio {:.2} outside recommended {:.2}..{:.2}",
                ratio, MIN_ASPECT_RATIO, MAX_ASPECT_RATIO
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    /// Collapse the hard issues into one classified error.
    ///
    /// Download failure wins over byte size, which wins over format, which
    /// wins over everything else, so that the recorded error code names the
    /// most specific problem.
    pub fn to_error(&self) -> Option<PublishError> {
        if self.issues.is_empty() {
            return None;
        }

        for issue in &self.issues {
            if let ValidationIssue::DownloadFailed(reason) = issue {
                return Some(PublishError::ImageDownloadFailed(reason.clone()));
            }
        }
        for issue in &self.issues {
            if let ValidationIssue::TooLarge { size, limit } = issue {
                return Some(PublishError::ImageTooLarge {
                    size: *size,
                    limit: *limit,
                });
            }
        }
        for issue in &self.issues {
            if let ValidationIssue::UnsupportedFormat(format) = issue {
                return Some(PublishError::UnsupportedFormat(format.clone()));
            }
        }

        Some(PublishError::ImageValidationFailed(
            self.issues.iter().map(ToString::to_string).collect(),
        ))
    }
}

/// Header-level facts about an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbedImage {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub has_transparency: bool,
    pub size: u64,
}

impl ProbedImage {
    /// Copy the probed facts onto a candidate
    pub fn apply_to(&self, candidate: &mut ImageCandidate) {
        candidate.format = Some(self.format);
        candidate.width = Some(self.width);
        candidate.height = Some(self.height);
        candidate.has_transparency = Some(self.has_transparency);
        candidate.file_size_bytes = Some(self.size);
    }
}

/// Read format, dimensions and alpha from the image header without decoding
/// the pixel data.
pub fn probe(bytes: &[u8]) -> Result<ProbedImage, PublishError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| {
            PublishError::ImageValidationFailed(vec![format!("unreadable image: {}", e)])
        })?;

    let detected = reader
        .format()
        .ok_or_else(|| PublishError::UnsupportedFormat("unrecognised image data".to_string()))?;
    let format = ImageFormat::from_image_format(detected)
        .ok_or_else(|| PublishError::UnsupportedFormat(format!("{:?}", detected).to_lowercase()))?;

    let decoder = reader.into_decoder().map_err(|e| match e {
        image::ImageError::Unsupported(_) => PublishError::UnsupportedFormat(format.to_string()),
        other => PublishError::ImageValidationFailed(vec![format!("unreadable image: {}", other)]),
    })?;

    let (width, height) = decoder.dimensions();
    let has_transparency = decoder.color_type().has_alpha();

    Ok(ProbedImage {
        format,
        width,
        height,
        has_transparency,
        size: bytes.len() as u64,
    })
}

/// Report for a candidate whose bytes could not be fetched
pub fn download_failure(error: &PublishError) -> ValidationReport {
    let issue = match error {
        PublishError::ImageTooLarge { size, limit } => ValidationIssue::TooLarge {
            size: *size,
            limit: *limit,
        },
        PublishError::UnsupportedFormat(format) => ValidationIssue::UnsupportedFormat(format.clone()),
        other => ValidationIssue::DownloadFailed(other.to_string()),
    };
    ValidationReport {
        issues: vec![issue],
        warnings: Vec::new(),
    }
}

/// Check a probed candidate against the limits
pub fn validate_candidate(candidate: &ImageCandidate, limits: &ImageLimits) -> ValidationReport {
    let mut report = ValidationReport::default();

    match candidate.format {
        Some(format) if format.is_platform_allowed() => {}
        Some(format) => report
            .issues
            .push(ValidationIssue::UnsupportedFormat(format.to_string())),
        None => report
            .issues
            .push(ValidationIssue::UnsupportedFormat("unknown".to_string())),
    }

    match (candidate.width, candidate.height) {
        (Some(width), Some(height)) => {
            if width < limits.min_width || height < limits.min_height {
                report.issues.push(ValidationIssue::TooSmall {
                    width,
                    height,
                    min_width: limits.min_width,
                    min_height: limits.min_height,
                });
            }
            if width > limits.warn_max_width || height > limits.warn_max_height {
                report.warnings.push(ValidationWarning::OversizedDimensions {
                    width,
                    height,
                    max_width: limits.warn_max_width,
                    max_height: limits.warn_max_height,
                });
            }
            if height > 0 {
                let ratio = f64::from(width) / f64::from(height);
                if !(MIN_ASPECT_RATIO..=MAX_ASPECT_RATIO).contains(&ratio) {
                    report.warnings.push(ValidationWarning::AspectRatio(ratio));
                }
            }
        }
        _ => report
            .issues
            .push(ValidationIssue::Unreadable("dimensions unknown".to_string())),
    }

    if let Some(size) = candidate.file_size_bytes {
        if size > limits.max_bytes {
            report.issues.push(ValidationIssue::TooLarge {
                size,
                limit: limits.max_bytes,
            });
        }
    }

    report
}
