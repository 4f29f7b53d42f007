//! Occurrences, evidence artifacts and the status-history audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{
    B2bShipmentId, B2bShipmentStatus, DriverId, OccurrenceId, ShipmentId, ShipmentStatus,
    VolumeId, VolumeStatus,
};

/// Kind of an occurrence record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceType {
    /// Collection done at the sender (registrable)
    ColetaRealizada,
    /// Failed delivery attempt (registrable, observations mandatory)
    TentativaEntrega,
    /// Delivered (registrable)
    Entregue,
    /// Written per photo when a B2B collection leg is finalized
    ColetaFinalizada,
    /// Written per photo when a delivery is finalized
    EntregaFinalizada,
}

impl OccurrenceType {
    pub const REGISTRABLE: [OccurrenceType; 3] = [
        OccurrenceType::ColetaRealizada,
        OccurrenceType::TentativaEntrega,
        OccurrenceType::Entregue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OccurrenceType::ColetaRealizada => "coleta_realizada",
            OccurrenceType::TentativaEntrega => "tentativa_entrega",
            OccurrenceType::Entregue => "entregue",
            OccurrenceType::ColetaFinalizada => "coleta_finalizada",
            OccurrenceType::EntregaFinalizada => "entrega_finalizada",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coleta_realizada" => Some(OccurrenceType::ColetaRealizada),
            "tentativa_entrega" => Some(OccurrenceType::TentativaEntrega),
            "entregue" => Some(OccurrenceType::Entregue),
            "coleta_finalizada" => Some(OccurrenceType::ColetaFinalizada),
            "entrega_finalizada" => Some(OccurrenceType::EntregaFinalizada),
            _ => None,
        }
    }

    /// Shipment status an occurrence of this type forces. Only the
    /// registrable types are bound to a status.
    pub fn target_status(&self) -> Option<ShipmentStatus> {
        match self {
            OccurrenceType::ColetaRealizada => Some(ShipmentStatus::ColetaFinalizada),
            OccurrenceType::TentativaEntrega => Some(ShipmentStatus::TentativaEntrega),
            OccurrenceType::Entregue => Some(ShipmentStatus::EntregaFinalizada),
            OccurrenceType::ColetaFinalizada | OccurrenceType::EntregaFinalizada => None,
        }
    }

    pub fn requires_observations(&self) -> bool {
        matches!(self, OccurrenceType::TentativaEntrega)
    }

    /// Whether registering this kind completes a pickup or a delivery
    pub fn finalizes(&self) -> bool {
        matches!(
            self,
            OccurrenceType::ColetaRealizada | OccurrenceType::Entregue
        )
    }

    pub fn requires_photo(&self) -> bool {
        matches!(self, OccurrenceType::Entregue)
    }

    pub fn default_description(&self) -> &'static str {
        match self {
            OccurrenceType::ColetaRealizada => "Coleta realizada",
            OccurrenceType::TentativaEntrega => "Tentativa de entrega sem sucesso",
            OccurrenceType::Entregue => "Objeto entregue ao destinatário",
            OccurrenceType::ColetaFinalizada => "Coleta finalizada",
            OccurrenceType::EntregaFinalizada => "Entrega finalizada",
        }
    }
}

impl fmt::Display for OccurrenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record an occurrence or history row is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Shipment(ShipmentId),
    B2bShipment(B2bShipmentId),
    Volume(VolumeId),
}

impl Subject {
    pub fn kind(&self) -> &'static str {
        match self {
            Subject::Shipment(_) => "shipment",
            Subject::B2bShipment(_) => "b2b_shipment",
            Subject::Volume(_) => "b2b_volume",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Subject::Shipment(id) => id.0,
            Subject::B2bShipment(id) => id.0,
            Subject::Volume(id) => id.0,
        }
    }

    /// Rebuild from the persisted (kind, id) pair
    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "shipment" => Some(Subject::Shipment(ShipmentId::from_uuid(id))),
            "b2b_shipment" => Some(Subject::B2bShipment(B2bShipmentId::from_uuid(id))),
            "b2b_volume" => Some(Subject::Volume(VolumeId::from_uuid(id))),
            _ => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.id())
    }
}

/// A status value from any of the three machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum StatusValue {
    Shipment(ShipmentStatus),
    B2bShipment(B2bShipmentStatus),
    Volume(VolumeStatus),
}

impl StatusValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusValue::Shipment(s) => s.as_str(),
            StatusValue::B2bShipment(s) => s.as_str(),
            StatusValue::Volume(s) => s.as_str(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusValue::Shipment(s) => s.label(),
            StatusValue::B2bShipment(s) => s.label(),
            StatusValue::Volume(s) => s.label(),
        }
    }

    pub fn scope(&self) -> &'static str {
        match self {
            StatusValue::Shipment(_) => "shipment",
            StatusValue::B2bShipment(_) => "b2b_shipment",
            StatusValue::Volume(_) => "volume",
        }
    }

    /// Rebuild from the persisted (scope, value) pair
    pub fn from_parts(scope: &str, value: &str) -> Option<Self> {
        match scope {
            "shipment" => ShipmentStatus::parse(value).map(StatusValue::Shipment),
            "b2b_shipment" => B2bShipmentStatus::parse(value).map(StatusValue::B2bShipment),
            "volume" => VolumeStatus::parse(value).map(StatusValue::Volume),
            _ => None,
        }
    }
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured delivery/collection outcome. Read-only once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: OccurrenceId,
    pub subject: Subject,
    pub kind: OccurrenceType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
    /// Status the subject moved to as a result
    pub resulting_status: StatusValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    pub created_at: DateTime<Utc>,
}

/// Kind of an evidence artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Photo,
    Signature,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Photo => "photo",
            EvidenceKind::Signature => "signature",
        }
    }
}

/// An uploaded photo or signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceArtifact {
    pub kind: EvidenceKind,
    /// Object-storage key
    pub key: String,
    /// Public URL referenced from occurrence rows
    pub url: String,
    pub captured_at: DateTime<Utc>,
}

/// Append-only audit row; one per transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: Uuid,
    pub subject: Subject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    /// Who triggered the transition (see `SessionContext::describe`)
    pub actor: String,
    pub status: StatusValue,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StatusHistoryEntry {
    pub fn new(
        subject: Subject,
        status: StatusValue,
        actor: impl Into<String>,
        driver_id: Option<DriverId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            driver_id,
            actor: actor.into(),
            description: status.label().to_string(),
            status,
            observations: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_observations(mut self, observations: Option<String>) -> Self {
        self.observations = observations;
        self
    }
}
