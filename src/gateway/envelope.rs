//! Explicit response envelope
//!
//! Backends answer either with a bare payload or with
//! `{ "success": bool, "data": ..., "error": ... }`. Both shapes are
//! normalized here so callers never probe loosely-typed JSON.

use crate::error::AppError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Successful envelopes must carry data; failed ones become network errors
    pub fn into_result(self) -> Result<T, AppError> {
        if !self.success {
            return Err(AppError::NetworkError(
                self.error
                    .unwrap_or_else(|| "Request reported failure without a message".to_string()),
            ));
        }
        self.data.ok_or_else(|| {
            AppError::ValidationError("Successful response is missing `data`".to_string())
        })
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Interpret a response body. Objects with a `success` key are treated as
    /// envelopes; anything else is the payload itself.
    pub fn from_value(body: Value) -> Result<Self, AppError> {
        let is_envelope = body
            .as_object()
            .is_some_and(|obj| obj.contains_key("success"));

        if is_envelope {
            return Ok(serde_json::from_value(body)?);
        }

        Ok(Envelope::ok(serde_json::from_value(body)?))
    }
}

/// Decode a response body straight to its payload
pub fn unwrap_body<T: DeserializeOwned>(body: Value) -> Result<T, AppError> {
    Envelope::<T>::from_value(body)?.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        name: String,
    }

    #[test]
    fn test_bare_payload() {
        let user: User = unwrap_body(json!({"name": "ada"})).unwrap();
        assert_eq!(user.name, "ada");
    }

    #[test]
    fn test_success_envelope() {
        let user: User = unwrap_body(json!({"success": true, "data": {"name": "ada"}})).unwrap();
        assert_eq!(user, User { name: "ada".to_string() });
    }

    #[test]
    fn test_failed_envelope_is_network_error() {
        let err = unwrap_body::<User>(json!({"success": false, "error": "quota exceeded"})).unwrap_err();
        assert_eq!(err, AppError::NetworkError("quota exceeded".to_string()));
    }

    #[test]
    fn test_success_without_data_is_validation_error() {
        let err = unwrap_body::<User>(json!({"success": true})).unwrap_err();
        assert_eq!(err.error_code(), "validation_error");
    }

    #[test]
    fn test_failed_envelope_without_data_or_message() {
        // `User` has no Default; missing optional keys still decode
        let envelope = Envelope::<User>::from_value(json!({"success": false})).unwrap();
        assert_eq!(envelope.data, None);
        assert_eq!(envelope.error, None);
        assert_eq!(envelope.into_result().unwrap_err().error_code(), "network_error");
    }

    #[test]
    fn test_shape_mismatch_is_validation_error() {
        let err = unwrap_body::<User>(json!({"success": true, "data": {"nom": 1}})).unwrap_err();
        assert_eq!(err.error_code(), "validation_error");

        let err = unwrap_body::<User>(json!({"success": "yes"})).unwrap_err();
        assert_eq!(err.error_code(), "validation_error");
    }

    #[test]
    fn test_untyped_payload_passthrough() {
        let value: Value = unwrap_body(json!([1, 2, 3])).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }
}
