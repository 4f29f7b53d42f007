//! Storage and notification seams of the workflow engine

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::domain::{
    B2bShipment, B2bShipmentId, B2bShipmentStatus, B2bVolume, DriverId, Occurrence, Shipment,
    ShipmentId, ShipmentStatus, StatusHistoryEntry, StatusValue, Subject, VolumeId, VolumeStatus,
};

use super::Result;

/// What a transition does to the assigned driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverChange {
    Keep,
    Assign(DriverId),
    Clear,
}

impl DriverChange {
    pub fn apply(&self, current: Option<DriverId>) -> Option<DriverId> {
        match self {
            DriverChange::Keep => current,
            DriverChange::Assign(driver) => Some(*driver),
            DriverChange::Clear => None,
        }
    }
}

/// One atomic status change of a non-B2B shipment.
///
/// Applied as a unit: the conditional status update, the occurrence rows and
/// the history row either all land or none do.
#[derive(Debug, Clone)]
pub struct ShipmentTransition {
    pub shipment_id: ShipmentId,
    /// Status read before the write; the update is rejected if it changed
    pub expected: ShipmentStatus,
    pub next: ShipmentStatus,
    pub driver: DriverChange,
    pub occurrences: Vec<Occurrence>,
    pub history: StatusHistoryEntry,
}

/// Status change of one volume, conditioned on its previous status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUpdate {
    pub volume_id: VolumeId,
    pub expected: VolumeStatus,
    pub next: VolumeStatus,
}

/// One atomic status change of a B2B shipment and (optionally) its volumes
#[derive(Debug, Clone)]
pub struct B2bTransition {
    pub shipment_id: B2bShipmentId,
    pub expected: B2bShipmentStatus,
    pub next: B2bShipmentStatus,
    pub driver: DriverChange,
    pub volumes: Vec<VolumeUpdate>,
    pub occurrences: Vec<Occurrence>,
    pub history: StatusHistoryEntry,
}

/// Persistence of non-B2B shipments, their occurrences and history
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ShipmentRepository: Send + Sync {
    /// Insert a new shipment with its first history row
    async fn insert_shipment(&self, shipment: &Shipment, history: &StatusHistoryEntry)
        -> Result<()>;

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>>;

    /// Apply a transition atomically, returning the updated shipment.
    ///
    /// Fails with `StaleState` when the stored status differs from
    /// `transition.expected`.
    async fn apply_shipment_transition(&self, transition: ShipmentTransition) -> Result<Shipment>;

    /// History rows, oldest first
    async fn shipment_history(&self, id: ShipmentId) -> Result<Vec<StatusHistoryEntry>>;

    async fn shipment_occurrences(&self, id: ShipmentId) -> Result<Vec<Occurrence>>;
}

/// Persistence of B2B shipments and volumes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait B2bRepository: Send + Sync {
    async fn insert_b2b_shipment(
        &self,
        shipment: &B2bShipment,
        volumes: &[B2bVolume],
        history: &StatusHistoryEntry,
    ) -> Result<()>;

    async fn get_b2b_shipment(&self, id: B2bShipmentId) -> Result<Option<B2bShipment>>;

    /// Volumes ordered by sequence number
    async fn volumes(&self, id: B2bShipmentId) -> Result<Vec<B2bVolume>>;

    async fn get_volume(&self, id: VolumeId) -> Result<Option<B2bVolume>>;

    /// Apply a shipment-level transition atomically
    async fn apply_b2b_transition(&self, transition: B2bTransition) -> Result<B2bShipment>;

    /// Move one volume, conditioned on its previous status
    async fn apply_volume_update(
        &self,
        update: VolumeUpdate,
        history: StatusHistoryEntry,
    ) -> Result<B2bVolume>;

    /// History of the shipment and all of its volumes, oldest first
    async fn b2b_history(&self, id: B2bShipmentId) -> Result<Vec<StatusHistoryEntry>>;

    async fn b2b_occurrences(&self, id: B2bShipmentId) -> Result<Vec<Occurrence>>;
}

/// Object storage for photos and signatures
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EvidenceStorage: Send + Sync {
    /// Store an object and return its public URL
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Payload sent to notification endpoints after a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub subject: Subject,
    pub tracking_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<StatusValue>,
    pub status: StatusValue,
    pub label: String,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
}

impl StatusNotification {
    pub fn new(
        subject: Subject,
        tracking_code: impl Into<String>,
        previous: Option<StatusValue>,
        status: StatusValue,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            subject,
            tracking_code: tracking_code.into(),
            previous,
            label: status.label().to_string(),
            status,
            actor: actor.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Best-effort outbound notifications.
///
/// Implementations must return promptly and never report failure; the
/// workflow does not depend on delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: StatusNotification);
}

/// Notifier that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: StatusNotification) {}
}

/// Individual component health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ComponentHealth {
    Healthy,
    Unhealthy(String),
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentHealth::Healthy)
    }
}

/// Health check for a storage backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check_health(&self) -> ComponentHealth;
}
