//! Typed failure taxonomy shared by the vault, the adapters and the service.
//!
//! Every fallible operation in the framework returns [`ConnectorError`]. Callers
//! match on [`ConnectorError::kind`] instead of parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the connector framework.
///
/// The type is `Clone` so a single outcome (for example one OAuth refresh) can
/// be delivered to every waiter that queued on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Malformed caller input. Never reaches a backend.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Data access before `initialize()` or after `dispose()`.
    #[error("Connector not initialized: {0}")]
    NotInitialized(String),

    /// Decrypted credentials failed the adapter's shape check, or the backend
    /// rejected them.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Backend unreachable.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Backend did not answer within the per-call timeout.
    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// Backend accepted the call but returned a failure or a malformed result.
    #[error("Query failed: {message}")]
    QueryFailed {
        message: String,
        /// HTTP status (API connectors) when the failure came from a response.
        status: Option<u16>,
    },

    /// Admission denied by the rate limiter.
    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded { retry_after_ms: u64 },

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Duplicate connector slug within an organization.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown connector id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence collaborator failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Stable, message-free discriminant of a [`ConnectorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    NotInitialized,
    InvalidCredentials,
    ConnectionFailed,
    ConnectionTimeout,
    QueryFailed,
    RateLimitExceeded,
    DecryptionFailed,
    EncryptionFailed,
    Conflict,
    NotFound,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::NotInitialized => "NOT_INITIALIZED",
            ErrorKind::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            ErrorKind::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorKind::QueryFailed => "QUERY_FAILED",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorKind::EncryptionFailed => "ENCRYPTION_FAILED",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Storage => "STORAGE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConnectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::Validation(_) => ErrorKind::ValidationError,
            ConnectorError::NotInitialized(_) => ErrorKind::NotInitialized,
            ConnectorError::InvalidCredentials(_) => ErrorKind::InvalidCredentials,
            ConnectorError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            ConnectorError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            ConnectorError::QueryFailed { .. } => ErrorKind::QueryFailed,
            ConnectorError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            ConnectorError::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            ConnectorError::EncryptionFailed(_) => ErrorKind::EncryptionFailed,
            ConnectorError::Conflict(_) => ErrorKind::Conflict,
            ConnectorError::NotFound(_) => ErrorKind::NotFound,
            ConnectorError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Shorthand for a backend failure without an HTTP status.
    pub fn query_failed(message: impl Into<String>) -> Self {
        ConnectorError::QueryFailed {
            message: message.into(),
            status: None,
        }
    }

    /// Returns true for failures worth retrying locally: timeouts and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::ConnectionTimeout { .. } => true,
            ConnectorError::QueryFailed {
                status: Some(status),
                ..
            } => (500..600).contains(status),
            _ => false,
        }
    }

    /// HTTP status the routing collaborator should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ConnectorError::Validation(_) => 400,
            ConnectorError::InvalidCredentials(_) => 401,
            ConnectorError::NotFound(_) => 404,
            ConnectorError::Conflict(_) => 409,
            ConnectorError::NotInitialized(_) => 409,
            ConnectorError::RateLimitExceeded { .. } => 429,
            ConnectorError::ConnectionFailed(_) | ConnectorError::QueryFailed { .. } => 502,
            ConnectorError::ConnectionTimeout { .. } => 504,
            ConnectorError::DecryptionFailed(_)
            | ConnectorError::EncryptionFailed(_)
            | ConnectorError::Storage(_) => 500,
        }
    }
}

/// Result type alias using ConnectorError
pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ConnectorError::ConnectionTimeout { timeout_ms: 30_000 }.is_transient());
        assert!(ConnectorError::QueryFailed {
            message: "bad gateway".into(),
            status: Some(502),
        }
        .is_transient());

        assert!(!ConnectorError::QueryFailed {
            message: "not found".into(),
            status: Some(404),
        }
        .is_transient());
        assert!(!ConnectorError::query_failed("syntax error").is_transient());
        assert!(!ConnectorError::ConnectionFailed("refused".into()).is_transient());
        assert!(!ConnectorError::InvalidCredentials("401".into()).is_transient());
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(
            ConnectorError::Validation("x".into()).kind().as_str(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            ConnectorError::RateLimitExceeded { retry_after_ms: 10 }.kind(),
            ErrorKind::RateLimitExceeded
        );
        let json = serde_json::to_string(&ErrorKind::ConnectionTimeout).unwrap();
        assert_eq!(json, "\"CONNECTION_TIMEOUT\"");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ConnectorError::NotFound("c1".into()).status_code(), 404);
        assert_eq!(ConnectorError::Conflict("orders-db".into()).status_code(), 409);
        assert_eq!(
            ConnectorError::RateLimitExceeded { retry_after_ms: 1 }.status_code(),
            429
        );
        assert_eq!(ConnectorError::Validation("limit".into()).status_code(), 400);
    }
}
