//! Structured API error responses with error codes
//!
//! Every failure leaves the API as an [`ApiError`]: a stable machine-readable
//! code, its numeric category and a human-readable message.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::LogisticsError;

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes for API responses
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authorization errors (1xxx)
    /// Actor may not perform this operation
    InsufficientPermissions,

    // Validation errors (3xxx)
    /// Request body is malformed
    InvalidRequestBody,
    /// Field value is invalid
    InvalidFieldValue,
    /// Occurrence type needs observations
    MissingObservations,
    /// A mandatory photo was not attached
    EvidenceRequired,
    /// Scanned code matches no required code
    UnknownCode,

    // Resource errors (4xxx)
    /// Requested resource not found
    ResourceNotFound,

    // Conflict errors (5xxx)
    /// Code already scanned
    DuplicateCode,

    // State errors (7xxx)
    /// Transition not allowed from the current status
    InvalidStateTransition,
    /// Status changed since it was read
    StaleState,
    /// Another transition on the record is running
    TransitionInFlight,
    /// Not every volume code was scanned
    ValidationIncomplete,
    /// No driver is assigned
    DriverRequired,

    // Infrastructure errors (8xxx)
    /// Database operation failed
    DatabaseError,
    /// Object storage rejected an upload
    UploadFailed,
    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn numeric_code(&self) -> u32 {
        match self {
            ErrorCode::InsufficientPermissions => 1005,

            ErrorCode::InvalidRequestBody => 3001,
            ErrorCode::InvalidFieldValue => 3003,
            ErrorCode::MissingObservations => 3010,
            ErrorCode::EvidenceRequired => 3011,
            ErrorCode::UnknownCode => 3012,

            ErrorCode::ResourceNotFound => 4001,

            ErrorCode::DuplicateCode => 5005,

            ErrorCode::InvalidStateTransition => 7001,
            ErrorCode::StaleState => 7004,
            ErrorCode::TransitionInFlight => 7005,
            ErrorCode::ValidationIncomplete => 7006,
            ErrorCode::DriverRequired => 7007,

            ErrorCode::DatabaseError => 8001,
            ErrorCode::UploadFailed => 8004,
            ErrorCode::InternalError => 8999,
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InsufficientPermissions => StatusCode::FORBIDDEN,

            ErrorCode::InvalidRequestBody => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidFieldValue => StatusCode::BAD_REQUEST,
            ErrorCode::MissingObservations => StatusCode::BAD_REQUEST,
            ErrorCode::EvidenceRequired => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::UnknownCode => StatusCode::UNPROCESSABLE_ENTITY,

            ErrorCode::ResourceNotFound => StatusCode::NOT_FOUND,

            ErrorCode::DuplicateCode => StatusCode::CONFLICT,

            ErrorCode::InvalidStateTransition => StatusCode::CONFLICT,
            ErrorCode::StaleState => StatusCode::CONFLICT,
            ErrorCode::TransitionInFlight => StatusCode::CONFLICT,
            ErrorCode::ValidationIncomplete => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::DriverRequired => StatusCode::CONFLICT,

            ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UploadFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::MissingObservations => "MISSING_OBSERVATIONS",
            ErrorCode::EvidenceRequired => "EVIDENCE_REQUIRED",
            ErrorCode::UnknownCode => "UNKNOWN_CODE",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::DuplicateCode => "DUPLICATE_CODE",
            ErrorCode::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorCode::StaleState => "STALE_STATE",
            ErrorCode::TransitionInFlight => "TRANSITION_IN_FLIGHT",
            ErrorCode::ValidationIncomplete => "VALIDATION_INCOMPLETE",
            ErrorCode::DriverRequired => "DRIVER_REQUIRED",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::UploadFailed => "UPLOAD_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

/// Detailed error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code for easy categorization
    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Related resource ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
                resource_id: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.error.resource_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code_str = self.error.code.as_str();
        let mut response = (status, Json(self)).into_response();

        response.headers_mut().insert(
            axum::http::header::HeaderName::from_static("x-error-code"),
            axum::http::HeaderValue::from_static(code_str),
        );

        response
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<LogisticsError> for ApiError {
    fn from(err: LogisticsError) -> Self {
        let message = err.to_string();
        match err {
            LogisticsError::InvalidState {
                entity_type,
                entity_id,
                from,
                to,
            } => ApiError::new(ErrorCode::InvalidStateTransition, message)
                .with_resource_id(entity_id.clone())
                .with_details(serde_json::json!({
                    "entity_type": entity_type,
                    "entity_id": entity_id,
                    "from_state": from,
                    "to_state": to
                })),
            LogisticsError::StaleState {
                entity_type,
                entity_id,
                expected,
                actual,
            } => ApiError::new(ErrorCode::StaleState, message)
                .with_resource_id(entity_id.clone())
                .with_details(serde_json::json!({
                    "entity_type": entity_type,
                    "entity_id": entity_id,
                    "expected_state": expected,
                    "actual_state": actual
                })),
            LogisticsError::NotFound {
                entity_type,
                entity_id,
            } => ApiError::new(ErrorCode::ResourceNotFound, message)
                .with_resource_id(entity_id)
                .with_details(serde_json::json!({ "entity_type": entity_type })),
            LogisticsError::ValidationIncomplete { scanned, required } => {
                ApiError::new(ErrorCode::ValidationIncomplete, message).with_details(
                    serde_json::json!({ "scanned": scanned, "required": required }),
                )
            }
            LogisticsError::EvidenceRequired(_) => {
                ApiError::new(ErrorCode::EvidenceRequired, message)
            }
            LogisticsError::DuplicateCode(code) => {
                ApiError::new(ErrorCode::DuplicateCode, message)
                    .with_details(serde_json::json!({ "code": code }))
            }
            LogisticsError::UnknownCode(code) => ApiError::new(ErrorCode::UnknownCode, message)
                .with_details(serde_json::json!({ "code": code })),
            LogisticsError::MissingObservations(_) => {
                ApiError::new(ErrorCode::MissingObservations, message)
            }
            LogisticsError::DriverRequired(record) => {
                ApiError::new(ErrorCode::DriverRequired, message).with_resource_id(record)
            }
            LogisticsError::Forbidden(_) => {
                ApiError::new(ErrorCode::InsufficientPermissions, message)
            }
            LogisticsError::TransitionInFlight(record) => {
                ApiError::new(ErrorCode::TransitionInFlight, message).with_resource_id(record)
            }
            LogisticsError::InvalidInput(_) => ApiError::new(ErrorCode::InvalidFieldValue, message),
            LogisticsError::UploadFailure(_) => ApiError::new(ErrorCode::UploadFailed, message),
            LogisticsError::Persistence(_) => ApiError::new(ErrorCode::DatabaseError, message),
            LogisticsError::Configuration(_) | LogisticsError::Internal(_) => {
                ApiError::new(ErrorCode::InternalError, message)
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(ErrorCode::InvalidRequestBody, rejection.body_text())
    }
}

/// Create a validation error with field details
pub fn validation_error(field: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::InvalidFieldValue, message.into())
        .with_details(serde_json::json!({ "field": field }))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numeric() {
        assert_eq!(ErrorCode::InsufficientPermissions.numeric_code(), 1005);
        assert_eq!(ErrorCode::InvalidRequestBody.numeric_code(), 3001);
        assert_eq!(ErrorCode::ResourceNotFound.numeric_code(), 4001);
        assert_eq!(ErrorCode::InvalidStateTransition.numeric_code(), 7001);
        assert_eq!(ErrorCode::DatabaseError.numeric_code(), 8001);
        assert_eq!(ErrorCode::InternalError.numeric_code(), 8999);
    }

    #[test]
    fn test_logistics_errors_map_to_codes() {
        let cases = [
            (
                LogisticsError::invalid_state("shipment", "s1", "ENTREGA_FINALIZADA", "EM_TRANSITO"),
                ErrorCode::InvalidStateTransition,
                StatusCode::CONFLICT,
            ),
            (
                LogisticsError::EvidenceRequired("photo".to_string()),
                ErrorCode::EvidenceRequired,
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                LogisticsError::ValidationIncomplete {
                    scanned: 2,
                    required: 3,
                },
                ErrorCode::ValidationIncomplete,
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                LogisticsError::DuplicateCode("ETI-0001".to_string()),
                ErrorCode::DuplicateCode,
                StatusCode::CONFLICT,
            ),
            (
                LogisticsError::Forbidden("no".to_string()),
                ErrorCode::InsufficientPermissions,
                StatusCode::FORBIDDEN,
            ),
            (
                LogisticsError::UploadFailure("bucket".to_string()),
                ErrorCode::UploadFailed,
                StatusCode::BAD_GATEWAY,
            ),
            (
                LogisticsError::Persistence("down".to_string()),
                ErrorCode::DatabaseError,
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, code, status) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.error.code, code);
            assert_eq!(api.status(), status);
            assert!(!api.error.message.is_empty());
        }
    }

    #[test]
    fn test_validation_incomplete_details() {
        let api: ApiError = LogisticsError::ValidationIncomplete {
            scanned: 2,
            required: 3,
        }
        .into();
        let details = api.error.details.unwrap();
        assert_eq!(details["scanned"], 2);
        assert_eq!(details["required"], 3);
    }

    #[test]
    fn test_error_serialization() {
        let error = ApiError::new(ErrorCode::ResourceNotFound, "shipment not found: abc");
        let json = serde_json::to_string(&error).unwrap();

        assert!(json.contains("RESOURCE_NOT_FOUND"));
        assert!(json.contains("shipment not found"));
        assert!(json.contains("4001"));
    }

    #[test]
    fn test_error_header() {
        let response = ApiError::new(ErrorCode::DuplicateCode, "dup").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()["x-error-code"], "DUPLICATE_CODE");
    }
}
