//! Domain models for the shipment workflow engine
//!
//! Shipments, B2B shipments and their volumes, the status taxonomies of each
//! state machine, occurrences and the status-history audit trail.

mod address;
mod occurrence;
mod shipment;
mod status;
mod types;

pub use address::*;
pub use occurrence::*;
pub use shipment::*;
pub use status::*;
pub use types::*;
