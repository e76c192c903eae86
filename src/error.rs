//! Error types and validation for the data-access runtime

use serde::Serialize;
use std::fmt;

/// Longest signature accepted by the gateway
pub const MAX_SIGNATURE_LEN: usize = 2048;

/// Longest free-text query accepted by search
pub const MAX_QUERY_LEN: usize = 500;

/// Application error types.
///
/// Every variant carries owned strings so a single producer outcome can be
/// cloned out to all callers that joined the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AppError {
    NetworkError(String),
    Unauthorized(String),
    Timeout(String),
    Cancelled,
    ValidationError(String),
    StorageError(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            AppError::Cancelled => write!(f, "Cancelled"),
            AppError::ValidationError(msg) => write!(f, "Invalid input: {}", msg),
            AppError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Get the stable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NetworkError(_) => "network_error",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Timeout(_) => "timeout",
            AppError::Cancelled => "cancelled",
            AppError::ValidationError(_) => "validation_error",
            AppError::StorageError(_) => "storage_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Failures that came from the transport rather than local preconditions
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_) | AppError::Unauthorized(_) | AppError::Timeout(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert reqwest::Error to AppError
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout(err.to_string())
        } else if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            AppError::Unauthorized(err.to_string())
        } else {
            AppError::NetworkError(err.to_string())
        }
    }
}

/// Shape mismatches surface as validation failures, never as silent nulls
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

/// Convert std::io::Error to AppError
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::StorageError(err.to_string())
    }
}

/// Validation functions
pub fn validate_signature(signature: &str) -> Result<(), AppError> {
    if signature.is_empty() {
        return Err(AppError::ValidationError(
            "Signature cannot be empty".to_string(),
        ));
    }

    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(AppError::ValidationError(format!(
            "Signature too long, maximum {} bytes",
            MAX_SIGNATURE_LEN
        )));
    }

    if signature.chars().any(char::is_whitespace) {
        return Err(AppError::ValidationError(format!(
            "Signature must not contain whitespace: {:?}",
            signature
        )));
    }

    Ok(())
}

pub fn validate_query(query: &str) -> Result<(), AppError> {
    if query.chars().count() > MAX_QUERY_LEN {
        return Err(AppError::ValidationError(format!(
            "Query too long, maximum {} characters",
            MAX_QUERY_LEN
        )));
    }

    Ok(())
}

/// Normalize user-typed query text using Unicode NFC
pub fn normalize_text(text: &str) -> String {
    use unicode_normalization::UnicodeNormalization;
    text.nfc().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Cancelled.error_code(), "cancelled");
        assert_eq!(
            AppError::ValidationError("x".into()).error_code(),
            "validation_error"
        );
        assert_eq!(AppError::NetworkError("x".into()).error_code(), "network_error");
    }

    #[test]
    fn test_network_classification() {
        assert!(AppError::NetworkError("down".into()).is_network());
        assert!(AppError::Unauthorized("401".into()).is_network());
        assert!(!AppError::Cancelled.is_network());
        assert!(AppError::Cancelled.is_cancelled());
        assert!(!AppError::StorageError("disk".into()).is_network());
    }

    #[test]
    fn test_display() {
        let err = AppError::ValidationError("bad".to_string());
        assert_eq!(err.to_string(), "Invalid input: bad");
        assert_eq!(err.message(), "Invalid input: bad");
    }

    #[test]
    fn test_validate_signature() {
        assert!(validate_signature("GET:https://api.test/items").is_ok());
        assert!(validate_signature("token-refresh").is_ok());
        assert!(validate_signature("").is_err());
        assert!(validate_signature("GET: spaced").is_err());
        assert!(validate_signature(&"x".repeat(MAX_SIGNATURE_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_query() {
        assert!(validate_query("").is_ok());
        assert!(validate_query("hello world").is_ok());
        assert!(validate_query(&"q".repeat(MAX_QUERY_LEN + 1)).is_err());
    }

    #[test]
    fn test_normalize_text() {
        // e + combining acute composes to a single code point
        assert_eq!(normalize_text("  cafe\u{301} "), "caf\u{e9}");
    }

    #[test]
    fn test_serde_json_error_is_validation() {
        let err: AppError = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert_eq!(err.error_code(), "validation_error");
    }
}
