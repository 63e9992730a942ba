//! Error types shared across the engine.
//!
//! Every failure is translated into [`LicenseError`] before it leaves the
//! activation layer. Callers branch on [`LicenseError::kind`] and show
//! [`LicenseError::message`] / [`LicenseError::code`] to the user.

use thiserror::Error;

use crate::client::errors::{ClientApiError, ClientErrorCode};

/// Broad failure categories the UI and the engine branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed or missing input. Nothing was sent, nothing changed.
    Validation,
    /// The server could not be reached or failed on its side (5xx).
    Unavailable,
    /// The server answered and said no.
    Rejected,
    /// The outcome is unknown (timeout, unusable response).
    Ambiguous,
    /// Local storage, crypto or configuration failure.
    Local,
}

#[derive(Debug, Clone, Error)]
pub enum LicenseError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("license server error: {0}")]
    ServerError(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Rejected(ClientApiError),

    #[error("inconsistent server response: {0}")]
    InconsistentResponse(String),

    #[error("activation attempt interrupted: {0}")]
    Interrupted(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// Result type for engine operations.
pub type LicenseResult<T> = Result<T, LicenseError>;

impl LicenseError {
    /// Shorthand for a business rejection with a server-provided message.
    pub fn rejected(code: ClientErrorCode, message: impl Into<String>) -> Self {
        LicenseError::Rejected(ClientApiError::new(code, message))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            LicenseError::Validation(_) => FailureKind::Validation,
            LicenseError::Network(_) | LicenseError::ServerError(_) => FailureKind::Unavailable,
            LicenseError::Rejected(_) => FailureKind::Rejected,
            LicenseError::Timeout(_)
            | LicenseError::InconsistentResponse(_)
            | LicenseError::Interrupted(_) => FailureKind::Ambiguous,
            LicenseError::Storage(_)
            | LicenseError::EncryptionError(_)
            | LicenseError::DecryptionError(_)
            | LicenseError::ConfigError(_) => FailureKind::Local,
        }
    }

    /// True when retrying later may succeed and last-known-good data may be used.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LicenseError::Network(_) | LicenseError::ServerError(_) | LicenseError::Timeout(_)
        )
    }

    /// Opaque machine-readable code for UI guidance.
    pub fn code(&self) -> ClientErrorCode {
        match self {
            LicenseError::Validation(_) => ClientErrorCode::ValidationFailed,
            LicenseError::Network(_) => ClientErrorCode::NetworkUnavailable,
            LicenseError::ServerError(_) => ClientErrorCode::InternalError,
            LicenseError::Timeout(_) => ClientErrorCode::RequestTimeout,
            LicenseError::Rejected(api) => api.code,
            LicenseError::InconsistentResponse(_) | LicenseError::Interrupted(_) => {
                ClientErrorCode::InconsistentResponse
            }
            LicenseError::Storage(_)
            | LicenseError::EncryptionError(_)
            | LicenseError::DecryptionError(_)
            | LicenseError::ConfigError(_) => ClientErrorCode::LocalFailure,
        }
    }

    /// Human-readable message; for rejections this is the server's own text.
    pub fn message(&self) -> String {
        match self {
            LicenseError::Rejected(api) => api.message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for LicenseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LicenseError::Timeout(err.to_string())
        } else {
            LicenseError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for LicenseError {
    fn from(err: std::io::Error) -> Self {
        LicenseError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_kinds() {
        assert_eq!(
            LicenseError::Validation("empty code".into()).kind(),
            FailureKind::Validation
        );
        assert_eq!(
            LicenseError::Network("refused".into()).kind(),
            FailureKind::Unavailable
        );
        assert_eq!(
            LicenseError::ServerError("HTTP 502".into()).kind(),
            FailureKind::Unavailable
        );
        assert_eq!(
            LicenseError::rejected(ClientErrorCode::InvalidCode, "bad code").kind(),
            FailureKind::Rejected
        );
        assert_eq!(
            LicenseError::Timeout("10s".into()).kind(),
            FailureKind::Ambiguous
        );
        assert_eq!(
            LicenseError::InconsistentResponse("no payload".into()).kind(),
            FailureKind::Ambiguous
        );
    }

    #[test]
    fn transient_errors() {
        assert!(LicenseError::Network("x".into()).is_transient());
        assert!(LicenseError::Timeout("x".into()).is_transient());
        assert!(!LicenseError::Validation("x".into()).is_transient());
        assert!(!LicenseError::rejected(ClientErrorCode::CodeExpired, "x").is_transient());
    }

    #[test]
    fn rejection_keeps_server_message_and_code() {
        let err = LicenseError::rejected(
            ClientErrorCode::AlreadyActivated,
            "This code was used on another register",
        );
        assert_eq!(err.code(), ClientErrorCode::AlreadyActivated);
        assert_eq!(err.message(), "This code was used on another register");
    }

    #[test]
    fn local_errors_have_opaque_codes() {
        assert_eq!(
            LicenseError::Validation("empty".into()).code(),
            ClientErrorCode::ValidationFailed
        );
        assert_eq!(
            LicenseError::DecryptionError("tag".into()).code(),
            ClientErrorCode::LocalFailure
        );
    }
}
