use std::time::Duration;
use thiserror::Error;

/// Error categorization for the access layer
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (permanent failures)
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Environment error: {0}")]
    Environment(#[from] envy::Error),

    // I/O errors (potentially transient)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors (usually permanent)
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    // Network errors (transient)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network timeout after {timeout:?}: {message}")]
    NetworkTimeout { timeout: Duration, message: String },

    // Upstream service errors
    #[error("Upstream error from {endpoint}: {code} - {message}")]
    Upstream {
        endpoint: String,
        code: u16,
        message: String,
    },

    #[error("Rate limit exceeded: retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    // Credential pool exhausted while keys are configured
    #[error("No credential available: {reason}")]
    NoCredentialAvailable { reason: String },

    // Client errors (permanent - don't retry)
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    // Cache errors
    #[error("Cache error: {operation} failed - {reason}")]
    Cache { operation: String, reason: String },

    // Parse errors
    #[error("Parse error in {context}: {message}")]
    Parse { context: String, message: String },

    // General service error
    #[error("Service error: {0}")]
    Service(String),
}

/// Error categorization for callers deciding whether to retry.
///
/// The access layer itself never retries; it only classifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Permanent errors - should not retry
    Permanent,
    /// Transient errors - safe to retry
    Transient,
    /// Rate limited - retry with backoff
    RateLimited,
}

impl Error {
    /// Categorize error for retry logic
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::Environment(_)
            | Self::InvalidInput { .. }
            | Self::Parse { .. }
            | Self::Serde(_) => ErrorCategory::Permanent,

            Self::RateLimitExceeded { .. } => ErrorCategory::RateLimited,

            Self::Upstream { code, .. } => match *code {
                429 => ErrorCategory::RateLimited,
                400..=499 => ErrorCategory::Permanent,
                _ => ErrorCategory::Transient,
            },

            Self::Http(_)
            | Self::NetworkTimeout { .. }
            | Self::NoCredentialAvailable { .. }
            | Self::Io(_)
            | Self::Cache { .. }
            | Self::Service(_) => ErrorCategory::Transient,
        }
    }

    /// Check if error is retryable
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::RateLimited
        )
    }

    /// Get suggested retry delay for rate limited errors
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_status_categories() {
        let err = |code| Error::Upstream {
            endpoint: "esearch".to_string(),
            code,
            message: "status".to_string(),
        };

        assert_eq!(err(429).category(), ErrorCategory::RateLimited);
        assert_eq!(err(400).category(), ErrorCategory::Permanent);
        assert_eq!(err(503).category(), ErrorCategory::Transient);
        assert!(err(502).is_retryable());
        assert!(!err(404).is_retryable());
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let limited = Error::RateLimitExceeded {
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(1)));
        assert!(Error::Service("x".to_string()).retry_after().is_none());
    }

    #[test]
    fn test_display() {
        let err = Error::InvalidInput {
            field: "pmid".to_string(),
            reason: "must not be empty".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid input: pmid - must not be empty");
    }
}
