//! Error types for Syndicast

use thiserror::Error;

use crate::classify::PublishError;

pub type Result<T> = std::result::Result<T, SyndicastError>;

#[derive(Error, Debug)]
pub enum SyndicastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid attempt transition: {0}")]
    InvalidTransition(String),
}

impl SyndicastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicastError::InvalidInput(_) => 3,
            SyndicastError::Publish(PublishError::Auth {
                needs_reauth: true, ..
            }) => 2,
            SyndicastError::Publish(_) => 1,
            SyndicastError::InvalidTransition(_) => 1,
            SyndicastError::Config(_) => 1,
            SyndicastError::Database(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = SyndicastError::InvalidInput("Empty content id".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_needs_reauth() {
        let error = SyndicastError::Publish(PublishError::Auth {
            message: "invalid_grant".to_string(),
            needs_reauth: true,
        });
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_transient_auth_error() {
        let error = SyndicastError::Publish(PublishError::Auth {
            message: "token expired".to_string(),
            needs_reauth: false,
        });
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = SyndicastError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_database_error() {
        let db_error = DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
        assert_eq!(SyndicastError::Database(db_error).exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting_config() {
        let error = SyndicastError::Config(ConfigError::MissingField("platform.client_id".to_string()));
        assert_eq!(
            error.to_string(),
            "Configuration error: Missing required field: platform.client_id"
        );
    }

    #[test]
    fn test_error_message_formatting_invalid_value() {
        let error = ConfigError::InvalidValue {
            field: "images.jpeg_quality".to_string(),
            reason: "must be between 1 and 100".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid value for images.jpeg_quality: must be between 1 and 100"
        );
    }

    #[test]
    fn test_error_conversion_from_publish_error() {
        let error: SyndicastError = PublishError::Network("connection reset".to_string()).into();
        match error {
            SyndicastError::Publish(PublishError::Network(msg)) => {
                assert_eq!(msg, "connection reset");
            }
            other => panic!("Expected SyndicastError::Publish, got {:?}", other),
        }
    }

    #[test]
    fn test_error_conversion_from_db_error() {
        let db_error = DbError::CorruptRow {
            table: "publish_attempts",
            reason: "unknown status 'posted'".to_string(),
        };
        let error: SyndicastError = db_error.into();
        assert!(error.to_string().contains("publish_attempts"));
    }
}
