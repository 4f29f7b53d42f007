//! HTTP API for courier-flow
//!
//! REST endpoints for shipments, B2B orders and volumes, plus health and
//! metrics probes.

mod error;
mod health;
mod rest;
mod types;
mod utils;

pub use error::{validation_error, ApiError, ErrorCode, ErrorDetails};
pub use health::*;
pub use rest::router;
pub use types::*;
