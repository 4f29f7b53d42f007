//! Infrastructure layer
//!
//! Contains trait definitions and implementations for:
//! - Shipment and B2B persistence (PostgreSQL, in-memory)
//! - Evidence object storage (local filesystem, in-memory)
//! - Webhook notifications (bounded queue, retry, circuit breaker)

mod circuit_breaker;
mod error;
mod memory;
pub mod postgres;
mod retry;
mod storage;
mod traits;
mod webhook;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, CircuitState,
};
pub use error::*;
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use retry::{is_retryable_db_error, Retry, RetryConfig, RetryResult};
pub use storage::{InMemoryObjectStorage, LocalObjectStorage, StoredObject};
pub use traits::*;
pub use webhook::{WebhookConfig, WebhookDispatcher};
