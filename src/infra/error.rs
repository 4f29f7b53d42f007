//! Error types for the shipment workflow engine

use thiserror::Error;

/// Errors surfaced by workflow operations and storage adapters
#[derive(Error, Debug)]
pub enum LogisticsError {
    /// Transition attempted from a state that does not allow it
    #[error("invalid state transition for {entity_type}/{entity_id}: {from} -> {to}")]
    InvalidState {
        entity_type: String,
        entity_id: String,
        from: String,
        to: String,
    },

    /// Status changed between read and conditional write
    #[error("stale state for {entity_type}/{entity_id}: expected {expected}, found {actual}")]
    StaleState {
        entity_type: String,
        entity_id: String,
        expected: String,
        actual: String,
    },

    /// A mandatory photo was not supplied
    #[error("evidence required: {0}")]
    EvidenceRequired(String),

    /// Finalize attempted before every volume code was scanned
    #[error("code validation incomplete: {scanned} of {required} codes scanned")]
    ValidationIncomplete { scanned: usize, required: usize },

    /// Code already scanned for this shipment
    #[error("duplicate code: {0}")]
    DuplicateCode(String),

    /// Code matches none of the required codes
    #[error("unknown code: {0}")]
    UnknownCode(String),

    /// Object-storage write failed
    #[error("upload failed: {0}")]
    UploadFailure(String),

    /// Database write or read failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Record does not exist
    #[error("{entity_type} not found: {entity_id}")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },

    /// Occurrence type requires observations
    #[error("observations are required for occurrence type {0}")]
    MissingObservations(String),

    /// Shipment has no assigned driver
    #[error("no driver assigned to {0}")]
    DriverRequired(String),

    /// Actor may not perform this action
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Another transition on the same record has not finished
    #[error("transition already in progress for {0}")]
    TransitionInFlight(String),

    /// Malformed input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl LogisticsError {
    pub fn not_found(entity_type: &str, entity_id: impl ToString) -> Self {
        LogisticsError::NotFound {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    pub fn invalid_state(
        entity_type: &str,
        entity_id: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        LogisticsError::InvalidState {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn stale(
        entity_type: &str,
        entity_id: impl ToString,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        LogisticsError::StaleState {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Conflicts that a caller may resolve by re-reading and retrying
    pub fn is_conflict(&self) -> bool {
        matches!(self, LogisticsError::StaleState { .. })
    }
}

impl From<sqlx::Error> for LogisticsError {
    fn from(err: sqlx::Error) -> Self {
        LogisticsError::Persistence(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for LogisticsError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        LogisticsError::Persistence(format!("migration failed: {err}"))
    }
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, LogisticsError>;
