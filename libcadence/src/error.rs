//! Error types for Cadence

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Content generation failed: {0}")]
    Generation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent modification: {0}")]
    ConcurrencyConflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CadenceError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CadenceError::InvalidInput(_) => 3,
            CadenceError::Config(_) => 2,
            CadenceError::Quota(_) => 4,
            CadenceError::Database(_)
            | CadenceError::Publish(_)
            | CadenceError::Generation(_)
            | CadenceError::NotFound(_)
            | CadenceError::ConcurrencyConflict(_) => 1,
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

/// Allowance and credit failures returned by the quota ledger
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("{0}")]
    NoAllowance(String),

    #[error("access key has expired")]
    KeyExpired,

    #[error("access key has no remaining capacity")]
    KeyExhausted,

    #[error("access key is not valid")]
    KeyInvalid,
}

/// Failures of a single publish attempt
///
/// Cloneable so the outcome can be both logged and written to the post store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("upstream publish failed ({status}): {message}")]
    UpstreamPublishFailed { status: u16, message: String },

    #[error("account is not connected to the upstream platform")]
    NotConnected,

    #[error("upstream call timed out after {0}ms")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CadenceError::InvalidInput("bad weekday".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = CadenceError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_quota_error() {
        let error = CadenceError::Quota(QuotaError::KeyExhausted);
        assert_eq!(error.exit_code(), 4);
    }

    #[test]
    fn test_exit_code_runtime_errors() {
        assert_eq!(CadenceError::NotFound("post".to_string()).exit_code(), 1);
        assert_eq!(CadenceError::Generation("boom".to_string()).exit_code(), 1);
        assert_eq!(
            CadenceError::Publish(PublishError::NotConnected).exit_code(),
            1
        );
        assert_eq!(
            CadenceError::ConcurrencyConflict("post already claimed".to_string()).exit_code(),
            1
        );
    }

    #[test]
    fn test_insufficient_credits_message() {
        let error = QuotaError::InsufficientCredits {
            required: 10,
            available: 3,
        };
        assert_eq!(
            error.to_string(),
            "insufficient credits: 10 required, 3 available"
        );
    }

    #[test]
    fn test_upstream_publish_failed_message() {
        let error = CadenceError::Publish(PublishError::UpstreamPublishFailed {
            status: 422,
            message: "Duplicate post".to_string(),
        });
        assert_eq!(
            error.to_string(),
            "Publish error: upstream publish failed (422): Duplicate post"
        );
    }

    #[test]
    fn test_no_allowance_carries_reason() {
        let error = QuotaError::NoAllowance("no active subscription or access keys".to_string());
        assert_eq!(error.to_string(), "no active subscription or access keys");
    }

    #[test]
    fn test_error_conversion_from_quota_error() {
        let error: CadenceError = QuotaError::KeyInvalid.into();
        match error {
            CadenceError::Quota(QuotaError::KeyInvalid) => {}
            other => panic!("Expected CadenceError::Quota, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_error_clone() {
        let original = PublishError::TokenRefreshFailed("invalid_grant".to_string());
        assert_eq!(original.clone(), original);
    }
}
