//! Client-side error codes for the Tillgate license engine.
//!
//! These mirror the codes the license server puts in its error responses
//! and add a handful of client-only codes, so the UI can pick guidance
//! without parsing messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes returned by the license server or produced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientErrorCode {
    // === Activation Errors ===
    /// Activation or redemption code is not known
    InvalidCode,
    /// Code is past its validity window
    CodeExpired,
    /// Code was already redeemed
    CodeAlreadyUsed,
    /// License is bound to another device
    AlreadyActivated,
    /// Device has no activation on record
    NotActivated,
    /// Device must complete first-time activation
    FirstActivationRequired,
    /// Request device does not match the license
    DeviceMismatch,

    // === License State Errors ===
    /// License has expired
    LicenseExpired,
    /// License has been revoked
    LicenseRevoked,

    // === Request Errors ===
    /// Request was malformed
    InvalidRequest,
    /// Internal server error
    InternalError,

    // === Client-side ===
    /// Input rejected before any network call
    ValidationFailed,
    /// Server unreachable
    NetworkUnavailable,
    /// No answer within the request timeout
    RequestTimeout,
    /// Server answered with something unusable
    InconsistentResponse,
    /// Local storage, crypto or config failure
    LocalFailure,

    // === Unknown ===
    /// Unknown error code (forward compatibility)
    #[serde(other)]
    Unknown,
}

impl ClientErrorCode {
    /// Returns a default human-readable message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ClientErrorCode::InvalidCode => "Activation code is not valid",
            ClientErrorCode::CodeExpired => "Activation code has expired",
            ClientErrorCode::CodeAlreadyUsed => "Activation code was already used",
            ClientErrorCode::AlreadyActivated => "License is already activated on another device",
            ClientErrorCode::NotActivated => "This device is not activated",
            ClientErrorCode::FirstActivationRequired => "First-time activation is required",
            ClientErrorCode::DeviceMismatch => "License belongs to a different device",
            ClientErrorCode::LicenseExpired => "License has expired",
            ClientErrorCode::LicenseRevoked => "License has been revoked",
            ClientErrorCode::InvalidRequest => "Invalid request",
            ClientErrorCode::InternalError => "Internal server error",
            ClientErrorCode::ValidationFailed => "Invalid input",
            ClientErrorCode::NetworkUnavailable => "License server is unreachable",
            ClientErrorCode::RequestTimeout => "License server did not answer in time",
            ClientErrorCode::InconsistentResponse => "License server sent an unusable answer",
            ClientErrorCode::LocalFailure => "Local license storage failed",
            ClientErrorCode::Unknown => "Unknown error",
        }
    }

    /// Returns true if the code is about the activation code the user typed.
    pub fn is_code_problem(&self) -> bool {
        matches!(
            self,
            ClientErrorCode::InvalidCode
                | ClientErrorCode::CodeExpired
                | ClientErrorCode::CodeAlreadyUsed
        )
    }

    /// Returns true if the server is saying this device holds no usable
    /// license, as opposed to rejecting one particular request.
    pub fn ends_license(&self) -> bool {
        matches!(
            self,
            ClientErrorCode::NotActivated
                | ClientErrorCode::LicenseExpired
                | ClientErrorCode::LicenseRevoked
                | ClientErrorCode::DeviceMismatch
        )
    }

    /// Returns true if retrying once connectivity returns might help.
    pub fn requires_online(&self) -> bool {
        matches!(
            self,
            ClientErrorCode::NetworkUnavailable
                | ClientErrorCode::RequestTimeout
                | ClientErrorCode::InternalError
        )
    }
}

impl fmt::Display for ClientErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.default_message())
    }
}

/// The inner error body from a server API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerErrorBody {
    /// Machine-readable error code
    pub code: ClientErrorCode,
    /// Human-readable error message
    #[serde(default)]
    pub message: String,
    /// Optional additional details
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// Nested error response shape:
/// ```json
/// { "error": { "code": "INVALID_CODE", "message": "Unknown code", "details": null } }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ServerErrorResponse {
    pub error: ServerErrorBody,
}

/// A business rejection from the license server.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientApiError {
    /// Machine-readable error code
    pub code: ClientErrorCode,
    /// Human-readable error message from server
    pub message: String,
    /// Optional additional details
    pub details: Option<serde_json::Value>,
}

impl ClientApiError {
    pub fn new(code: ClientErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            code.default_message().to_string()
        } else {
            message
        };
        Self {
            code,
            message,
            details: None,
        }
    }

    pub fn with_details(
        code: ClientErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            details: Some(details),
            ..Self::new(code, message)
        }
    }
}

impl fmt::Display for ClientApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ClientApiError {}

impl From<ServerErrorBody> for ClientApiError {
    fn from(body: ServerErrorBody) -> Self {
        Self {
            details: body.details,
            ..Self::new(body.code, body.message)
        }
    }
}

impl From<ServerErrorResponse> for ClientApiError {
    fn from(resp: ServerErrorResponse) -> Self {
        resp.error.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_server_error_response() {
        let json = r#"{
            "error": {
                "code": "CODE_EXPIRED",
                "message": "Code expired on 2024-03-01",
                "details": null
            }
        }"#;

        let resp: ServerErrorResponse = serde_json::from_str(json).unwrap();
        let err: ClientApiError = resp.into();
        assert_eq!(err.code, ClientErrorCode::CodeExpired);
        assert_eq!(err.message, "Code expired on 2024-03-01");
        assert!(err.details.is_none());
    }

    #[test]
    fn parse_unknown_error_code() {
        let json = r#"{"error": {"code": "SOMETHING_NEW", "message": "later"}}"#;
        let resp: ServerErrorResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error.code, ClientErrorCode::Unknown);
    }

    #[test]
    fn blank_message_falls_back_to_default() {
        let err = ClientApiError::new(ClientErrorCode::AlreadyActivated, "  ");
        assert_eq!(err.message, "License is already activated on another device");
    }

    #[test]
    fn details_survive_conversion() {
        let json = r#"{"error": {
            "code": "ALREADY_ACTIVATED",
            "message": "Bound to register 'Front desk'",
            "details": {"device_name": "Front desk"}
        }}"#;
        let err: ClientApiError = serde_json::from_str::<ServerErrorResponse>(json)
            .unwrap()
            .into();
        assert_eq!(err.code, ClientErrorCode::AlreadyActivated);
        assert!(err.details.is_some());
    }

    #[test]
    fn code_classification() {
        assert!(ClientErrorCode::InvalidCode.is_code_problem());
        assert!(ClientErrorCode::CodeAlreadyUsed.is_code_problem());
        assert!(!ClientErrorCode::NotActivated.is_code_problem());

        assert!(ClientErrorCode::NetworkUnavailable.requires_online());
        assert!(!ClientErrorCode::LicenseRevoked.requires_online());
    }

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ClientErrorCode::FirstActivationRequired).unwrap();
        assert_eq!(json, "\"FIRST_ACTIVATION_REQUIRED\"");
    }
}
