//! courier-flow
//!
//! Shipment lifecycle engine: driver pickup and delivery, B2B volume
//! tracking, evidence capture and occurrence recording.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (shipments, B2B orders, volumes, occurrences)
//! - [`workflow`] - State machines, code validation and evidence capture
//! - [`infra`] - Storage traits and adapters (PostgreSQL, in-memory), webhooks
//! - [`auth`] - Session extraction (JWT, anonymous checkout sessions)
//! - [`metrics`] - In-process counters and histograms
//! - [`api`] - REST routes
//! - [`server`] - Configuration and bootstrap

pub mod api;
pub mod auth;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod server;
pub mod workflow;

// Re-export commonly used types
pub use domain::{
    B2bShipment, B2bShipmentId, B2bShipmentStatus, B2bVolume, Occurrence, OccurrenceType,
    SessionContext, Shipment, ShipmentId, ShipmentStatus, VolumeId, VolumeStatus,
};

pub use infra::{LogisticsError, Result};
pub use workflow::{B2bWorkflow, ShipmentWorkflow};
