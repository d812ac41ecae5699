//! Configuration management for Syndicast

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::quota::QuotaLimits;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
    #[serde(default)]
    pub quotas: QuotaConfig,
    #[serde(default)]
    pub images: ImageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Target platform endpoints and OAuth client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub api_base_url: String,
    pub oauth_base_url: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
    #[serde(with = "duration_str")]
    pub api_timeout: Duration,
    #[serde(with = "duration_str")]
    pub media_timeout: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.linkedin.com".to_string(),
            oauth_base_url: "https://www.linkedin.com".to_string(),
            redirect_uri: None,
            scopes: ["openid", "profile", "email", "w_member_social"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            api_timeout: Duration::from_secs(30),
            media_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishingConfig {
    pub max_attempts: u32,
    /// Refresh the access token when it expires within this window
    #[serde(with = "duration_str")]
    pub token_refresh_buffer: Duration,
    /// Longest delay slept through inline; longer waits are rescheduled
    #[serde(with = "duration_str")]
    pub max_inline_delay: Duration,
    /// Directory of `<content_id>.json` content items read by the daemon
    pub content_dir: Option<String>,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            token_refresh_buffer: Duration::from_secs(30 * 60),
            max_inline_delay: Duration::from_secs(60),
            content_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub posts_per_day: u32,
    pub uploads_per_day: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            posts_per_day: 150,
            uploads_per_day: 150,
        }
    }
}

impl QuotaConfig {
    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            posts_per_day: self.posts_per_day,
            uploads_per_day: self.uploads_per_day,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub enabled: bool,
    pub min_width: u32,
    pub min_height: u32,
    /// Larger images only produce a warning
    pub warn_max_width: u32,
    pub warn_max_height: u32,
    /// Bounding box for processed images
    pub max_width: u32,
    pub max_height: u32,
    pub max_bytes: u64,
    pub jpeg_quality: u8,
    /// Resize and re-encode candidates before upload
    pub process: bool,
    /// Where processed images are cached; defaults to the system temp dir
    pub work_dir: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_width: 200,
            min_height: 200,
            warn_max_width: 7680,
            warn_max_height: 4320,
            max_width: 1920,
            max_height: 1920,
            max_bytes: 20 * 1024 * 1024,
            jpeg_quality: 85,
            process: true,
            work_dir: None,
        }
    }
}

impl ImageConfig {
    /// Resolve the processed-image cache directory
    pub fn resolve_work_dir(&self) -> PathBuf {
        match &self.work_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => std::env::temp_dir().join("syndicast-images"),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/syndicast/syndicast.db".to_string(),
            },
            platform: PlatformConfig::default(),
            publishing: PublishingConfig::default(),
            quotas: QuotaConfig::default(),
            images: ImageConfig::default(),
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.publishing.max_attempts == 0 {
            return Err(invalid("publishing.max_attempts", "must be at least 1"));
        }
        if self.quotas.posts_per_day == 0 {
            return Err(invalid("quotas.posts_per_day", "must be at least 1"));
        }
        if self.quotas.uploads_per_day == 0 {
            return Err(invalid("quotas.uploads_per_day", "must be at least 1"));
        }

        let images = &self.images;
        if images.jpeg_quality == 0 || images.jpeg_quality > 100 {
            return Err(invalid("images.jpeg_quality", "must be between 1 and 100"));
        }
        if images.min_width > images.max_width || images.min_height > images.max_height {
            return Err(invalid(
                "images.max_width",
                "maximum dimensions must not be below the minimum dimensions",
            ));
        }
        if images.max_width > images.warn_max_width || images.max_height > images.warn_max_height {
            return Err(invalid(
                "images.warn_max_width",
                "warning threshold must not be below the processing bounds",
            ));
        }
        if images.max_bytes == 0 {
            return Err(invalid("images.max_bytes", "must be greater than 0"));
        }

        url::Url::parse(&self.platform.api_base_url)
            .map_err(|e| invalid("platform.api_base_url", &e.to_string()))?;
        url::Url::parse(&self.platform.oauth_base_url)
            .map_err(|e| invalid("platform.oauth_base_url", &e.to_string()))?;

        Ok(())
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }

    /// Content directory with `~` expanded.
    ///
    /// The daemon cannot run without one.
    pub fn content_dir(&self) -> Result<PathBuf> {
        let dir = self
            .publishing
            .content_dir
            .as_deref()
            .filter(|dir| !dir.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField("publishing.content_dir".to_string()))?;
        Ok(PathBuf::from(shellexpand::tilde(dir).to_string()))
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::SyndicastError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path using the XDG base directories
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicast").join("config.toml"))
}

/// Durations as humantime strings ("30m", "120s")
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
