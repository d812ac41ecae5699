//! Syndicast - republish blog posts to a professional social network
//!
//! This library provides the publishing pipeline: OAuth token lifecycle,
//! post formatting, image selection and processing, the platform REST client,
//! failure classification with retries, and the per-post attempt state
//! machine that guarantees each content item is published at most once.

pub mod attempts;
pub mod classify;
pub mod config;
pub mod content;
pub mod credentials;
pub mod db;
pub mod error;
pub mod formatter;
pub mod images;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod queue;
pub mod quota;
pub mod retry;
pub mod token;
pub mod types;

// Re-export commonly used types
pub use attempts::{AttemptRepository, AttemptTracker, Claim, PublishSuccess};
pub use classify::{ErrorClassification, ErrorCode, PublishError, RecoveryStrategy};
pub use config::Config;
pub use content::{BlogPost, ContentSource, JsonDirectorySource, Postable, PreviewPost};
pub use credentials::CredentialStore;
pub use db::Database;
pub use error::{Result, SyndicastError};
pub use formatter::ContentFormatter;
pub use images::ImagePipeline;
pub use orchestrator::PublishingOrchestrator;
pub use platform::PublishingClient;
pub use queue::{PublishTask, TaskQueue};
pub use retry::RetryPolicy;
pub use token::TokenManager;
pub use types::{
    AttemptStatus, FormattedContent, ImageCandidate, ImageStatus, PublishAttempt,
    PublishCredential,
};
