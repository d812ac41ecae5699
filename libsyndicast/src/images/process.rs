//! Image processing: flatten, resize, re-encode as JPEG

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::classify::PublishError;
use crate::config::ImageConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self::from(&ImageConfig::default())
    }
}

impl From<&ImageConfig> for ProcessOptions {
    fn from(config: &ImageConfig) -> Self {
        Self {
            max_width: config.max_width,
            max_height: config.max_height,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// Decode `bytes`, flatten any alpha onto white, shrink to fit the bounding
/// box and encode as JPEG.
pub fn process_image(bytes: &[u8], options: &ProcessOptions) -> Result<Vec<u8>, PublishError> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| unreadable(&e))?
        .decode()
        .map_err(|e| unreadable(&e))?;

    let img = if img.color().has_alpha() {
        DynamicImage::ImageRgb8(flatten_onto_white(&img))
    } else {
        img
    };

    let img = if img.width() > options.max_width || img.height() > options.max_height {
        // resize() preserves aspect ratio and fits within the box
        img.resize(options.max_width, options.max_height, FilterType::Lanczos3)
    } else {
        img
    };

    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut output = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut output, options.jpeg_quality);
    rgb.write_with_encoder(encoder).map_err(|e| {
        PublishError::ImageValidationFailed(vec![format!("JPEG encoding failed: {}", e)])
    })?;

    Ok(output)
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = f32::from(a) / 255.0;
        let blend = |c: u8| (f32::from(c) * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }

    out
}

fn unreadable(e: &dyn std::fmt::Display) -> PublishError {
    PublishError::ImageValidationFailed(vec![format!("unreadable image: {}", e)])
}

/// Cache path for processed bytes: `<work_dir>/<sha256>.jpg`
pub fn cache_path(work_dir: &Path, processed: &[u8]) -> PathBuf {
    let digest = Sha256::digest(processed);
    let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    work_dir.join(format!("{}.jpg", name))
}

/// Write processed bytes into the cache, reusing an existing file with the
/// same content.
pub async fn store_processed(work_dir: &Path, processed: &[u8]) -> std::io::Result<PathBuf> {
    let path = cache_path(work_dir, processed);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(path);
    }

    tokio::fs::create_dir_all(work_dir).await?;
    // write then rename so concurrent readers never see a partial file
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    tokio::fs::write(&tmp, processed).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path)
}
