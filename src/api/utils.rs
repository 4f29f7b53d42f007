//! Utility functions for REST API handlers.

use base64::Engine;

use super::error::{validation_error, ApiError};

/// Decode base64 with flexible format support (standard, URL-safe, with/without padding).
/// Data URLs (`data:image/jpeg;base64,...`) are accepted too.
pub fn decode_base64_any(field: &str, s: &str) -> Result<Vec<u8>, ApiError> {
    let trimmed = s.trim();
    let payload = match trimmed.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => trimmed,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(payload))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(payload))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload))
        .map_err(|e| validation_error(field, format!("Invalid base64 in {field}: {e}")))
}
