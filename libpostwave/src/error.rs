//! Error types for Postwave

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PostwaveError>;

#[derive(Error, Debug)]
pub enum PostwaveError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// How the orchestrator should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Process-level setup is wrong; never retried.
    Configuration,
    /// User must re-authorize; never retried.
    Credential,
    /// Suspend until the reset time, then retry the same step.
    RateLimit,
    /// Worth another attempt under the retry policy.
    Transient,
    /// Retrying would produce the same result.
    Permanent,
}

impl PostwaveError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PostwaveError::InvalidInput(_) => 3,
            PostwaveError::Config(_) | PostwaveError::Registry(_) => 2,
            PostwaveError::Credential(_) => 2,
            PostwaveError::Platform(PlatformError::Authentication(_)) => 2,
            PostwaveError::Platform(_) => 1,
            PostwaveError::Database(_) => 1,
            PostwaveError::Checkpoint(_) => 1,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PostwaveError::Config(_) | PostwaveError::Registry(_) => ErrorClass::Configuration,
            PostwaveError::Credential(CredentialError::Refresh { transient: true, .. })
            | PostwaveError::Credential(CredentialError::Locked) => ErrorClass::Transient,
            PostwaveError::Credential(_) => ErrorClass::Credential,
            PostwaveError::Platform(e) => e.class(),
            PostwaveError::Database(_) => ErrorClass::Transient,
            PostwaveError::Checkpoint(_) | PostwaveError::InvalidInput(_) => ErrorClass::Permanent,
        }
    }

    /// Reset time carried by a rate-limit error, if this is one.
    pub fn rate_limit_reset(&self) -> Option<DateTime<Utc>> {
        match self {
            PostwaveError::Platform(PlatformError::RateLimited { reset_at, .. }) => Some(*reset_at),
            _ => None,
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

    #[error("Platform '{platform}' is not configured: {reason}")]
    PlatformNotConfigured { platform: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt column {column}: {reason}")]
    Corrupt { column: String, reason: String },
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Rate limited on {platform} until {reset_at}")]
    RateLimited {
        platform: String,
        reset_at: DateTime<Utc>,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl PlatformError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::RateLimited { .. } => ErrorClass::RateLimit,
            PlatformError::Authentication(_) => ErrorClass::Credential,
            PlatformError::Network(_) | PlatformError::Timeout(_) => ErrorClass::Transient,
            PlatformError::Api { status, .. } if *status >= 500 || *status == 408 => {
                ErrorClass::Transient
            }
            PlatformError::Api { .. }
            | PlatformError::Validation(_)
            | PlatformError::NotSupported(_) => ErrorClass::Permanent,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum CredentialError {
    #[error("No {platform} token stored for user {user_id}")]
    NotFound { user_id: String, platform: String },

    #[error("{platform} token for user {user_id} expired and cannot be refreshed: {reason}")]
    Expired {
        user_id: String,
        platform: String,
        reason: String,
    },

    #[error("{platform} token refresh failed: {reason}")]
    Refresh {
        platform: String,
        reason: String,
        transient: bool,
    },

    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Failed to encrypt credential")]
    Encryption,

    #[error("Failed to decrypt credential: {0}")]
    Decryption(String),

    #[error("Token is being refreshed by another worker")]
    Locked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Unsupported checkpoint version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Malformed checkpoint: {0}")]
    Malformed(String),

    #[error("Checkpoint is for a {found}-segment thread but the post has {expected} segments")]
    TotalMismatch { found: usize, expected: usize },

    #[error("Thread already complete ({0} segments)")]
    AlreadyComplete(usize),
}

#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error(
        "No handler registered for platform '{0}'; register one in the startup wiring \
         (see handlers::registry::default_registry)"
    )]
    NotRegistered(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = PostwaveError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_configuration() {
        let error: PostwaveError = ConfigError::MissingField("database.path".to_string()).into();
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_credential() {
        let error: PostwaveError = CredentialError::NotFound {
            user_id: "u1".to_string(),
            platform: "twitter".to_string(),
        }
        .into();
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_network_error() {
        let error: PostwaveError = PlatformError::Network("Connection refused".to_string()).into();
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting_api() {
        let error: PostwaveError = PlatformError::Api {
            status: 403,
            message: "forbidden".to_string(),
        }
        .into();
        assert_eq!(format!("{}", error), "Platform error: API error (403): forbidden");
    }

    #[test]
    fn test_registry_error_names_platform_and_fix() {
        let message = RegistryError::NotRegistered("mastodon".to_string()).to_string();
        assert!(message.contains("'mastodon'"));
        assert!(message.contains("default_registry"));
    }

    #[test]
    fn test_classification() {
        let rate: PostwaveError = PlatformError::RateLimited {
            platform: "twitter".to_string(),
            reset_at: Utc::now(),
        }
        .into();
        assert_eq!(rate.class(), ErrorClass::RateLimit);
        assert!(rate.rate_limit_reset().is_some());

        let server: PostwaveError = PlatformError::Api {
            status: 503,
            message: "unavailable".to_string(),
        }
        .into();
        assert_eq!(server.class(), ErrorClass::Transient);

        let client: PostwaveError = PlatformError::Api {
            status: 400,
            message: "bad".to_string(),
        }
        .into();
        assert_eq!(client.class(), ErrorClass::Permanent);

        let auth: PostwaveError = PlatformError::Authentication("revoked".to_string()).into();
        assert_eq!(auth.class(), ErrorClass::Credential);

        let config: PostwaveError = RegistryError::NotRegistered("x".to_string()).into();
        assert_eq!(config.class(), ErrorClass::Configuration);
    }

    #[test]
    fn test_transient_refresh_failure_is_retryable() {
        let error: PostwaveError = CredentialError::Refresh {
            platform: "linkedin".to_string(),
            reason: "connection reset".to_string(),
            transient: true,
        }
        .into();
        assert_eq!(error.class(), ErrorClass::Transient);

        let rejected: PostwaveError = CredentialError::Refresh {
            platform: "linkedin".to_string(),
            reason: "invalid_grant".to_string(),
            transient: false,
        }
        .into();
        assert_eq!(rejected.class(), ErrorClass::Credential);
    }
}
