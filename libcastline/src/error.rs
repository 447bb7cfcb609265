//! Error types for Castline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CastlineError>;

#[derive(Error, Debug)]
pub enum CastlineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid target selection: {0}")]
    InvalidTarget(String),

    #[error("Empty target selection: at least one social profile must be selected")]
    EmptySelection,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CastlineError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CastlineError::InvalidInput(_)
            | CastlineError::InvalidTarget(_)
            | CastlineError::EmptySelection
            | CastlineError::NotFound(_) => 3,
            CastlineError::Config(_) | CastlineError::Database(_) => 2,
            CastlineError::Platform(_) => 1,
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

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Failure reported by a platform publish call.
///
/// The variant decides retry eligibility, see [`PlatformError::is_transient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content rejected: {0}")]
    Validation(String),

    #[error("Account unavailable: {0}")]
    AccountRemoved(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Platform not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Platform server error: {0}")]
    Server(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl PlatformError {
    /// Network trouble, throttling, 5xx responses and timeouts are worth
    /// another attempt. Everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Network(_)
            | PlatformError::RateLimit(_)
            | PlatformError::Server(_)
            | PlatformError::Timeout(_) => true,
            PlatformError::Authentication(_)
            | PlatformError::Validation(_)
            | PlatformError::AccountRemoved(_)
            | PlatformError::Posting(_)
            | PlatformError::NotConfigured(_) => false,
        }
    }

    /// Short machine-readable code written into target response logs
    pub fn code(&self) -> &'static str {
        match self {
            PlatformError::Authentication(_) => "authentication",
            PlatformError::Validation(_) => "content_rejected",
            PlatformError::AccountRemoved(_) => "account_removed",
            PlatformError::Posting(_) => "posting_failed",
            PlatformError::NotConfigured(_) => "not_configured",
            PlatformError::Network(_) => "network",
            PlatformError::RateLimit(_) => "rate_limited",
            PlatformError::Server(_) => "server_error",
            PlatformError::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CastlineError::InvalidInput("Empty caption".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_selection_errors() {
        assert_eq!(CastlineError::EmptySelection.exit_code(), 3);
        assert_eq!(
            CastlineError::InvalidTarget("profile-1".to_string()).exit_code(),
            3
        );
    }

    #[test]
    fn test_exit_code_config_and_database() {
        let config_error = ConfigError::MissingField("database.path".to_string());
        assert_eq!(CastlineError::Config(config_error).exit_code(), 2);

        let db_error = DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
        assert_eq!(CastlineError::Database(db_error).exit_code(), 2);
    }

    #[test]
    fn test_exit_code_platform() {
        let error = CastlineError::Platform(PlatformError::Network("down".to_string()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(PlatformError::Network("reset".to_string()).is_transient());
        assert!(PlatformError::RateLimit("429".to_string()).is_transient());
        assert!(PlatformError::Server("503".to_string()).is_transient());
        assert!(PlatformError::Timeout("30s".to_string()).is_transient());

        assert!(!PlatformError::Authentication("bad token".to_string()).is_transient());
        assert!(!PlatformError::Validation("too long".to_string()).is_transient());
        assert!(!PlatformError::AccountRemoved("gone".to_string()).is_transient());
        assert!(!PlatformError::Posting("rejected".to_string()).is_transient());
        assert!(!PlatformError::NotConfigured("tiktok".to_string()).is_transient());
    }

    #[test]
    fn test_platform_error_codes() {
        assert_eq!(PlatformError::Timeout("x".to_string()).code(), "timeout");
        assert_eq!(
            PlatformError::Validation("x".to_string()).code(),
            "content_rejected"
        );
        assert_eq!(PlatformError::RateLimit("x".to_string()).code(), "rate_limited");
    }

    #[test]
    fn test_error_message_formatting() {
        let error = CastlineError::Platform(PlatformError::Authentication(
            "Instagram token revoked".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Platform error: Authentication failed: Instagram token revoked"
        );

        let error = CastlineError::Config(ConfigError::InvalidValue {
            field: "dispatch.max_attempts".to_string(),
            reason: "must be at least 1".to_string(),
        });
        assert_eq!(
            error.to_string(),
            "Configuration error: Invalid value for dispatch.max_attempts: must be at least 1"
        );
    }

    #[test]
    fn test_error_conversion_from_platform_error() {
        let platform_error = PlatformError::Posting("test".to_string());
        let error: CastlineError = platform_error.into();

        match error {
            CastlineError::Platform(_) => {}
            _ => panic!("Expected CastlineError::Platform"),
        }
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }
}
