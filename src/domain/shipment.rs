//! Shipment, B2B shipment and volume records

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    Address, B2bShipmentId, B2bShipmentStatus, DriverId, Package, PickupOption, SessionContext,
    ShipmentId, ShipmentStatus, TrackingCode, VolumeId, VolumeStatus,
};

/// Who owns a shipment: a signed-in user or an anonymous checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ShipmentOwner {
    User(Uuid),
    Session(String),
}

impl ShipmentOwner {
    pub fn from_session(session: &SessionContext) -> Self {
        match &session.session_id {
            Some(id) if session.actor_id.is_nil() => ShipmentOwner::Session(id.clone()),
            _ => ShipmentOwner::User(session.actor_id),
        }
    }
}

/// Fiscal data attached before payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentData {
    /// CPF/CNPJ of the sender
    pub document_number: String,
    /// NF-e access key, when the content is invoiced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_key: Option<String>,
    pub declared_value_cents: i64,
}

/// A single (non-B2B) shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: ShipmentId,
    pub tracking_code: TrackingCode,
    pub status: ShipmentStatus,
    pub sender: Address,
    pub recipient: Address,
    pub package: Package,
    pub service: String,
    pub pickup: PickupOption,
    pub price_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    pub owner: ShipmentOwner,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for promoting a quote into a shipment at checkout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewShipment {
    pub sender: Address,
    pub recipient: Address,
    pub package: Package,
    pub service: String,
    pub pickup: PickupOption,
    pub price_cents: i64,
    #[serde(default)]
    pub document: Option<DocumentData>,
}

/// Declared phase tag of a B2B shipment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum B2bShipmentType {
    /// `B2B-0`: collection-only leg
    #[serde(rename = "B2B-0")]
    Collection,
    /// `B2B-2`: delivery-only leg
    #[serde(rename = "B2B-2")]
    Delivery,
}

impl B2bShipmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            B2bShipmentType::Collection => "B2B-0",
            B2bShipmentType::Delivery => "B2B-2",
        }
    }

    /// Parse a stored tag; unknown tags yield `None` and fall back to status
    /// based classification.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "B2B-0" => Some(B2bShipmentType::Collection),
            "B2B-2" => Some(B2bShipmentType::Delivery),
            _ => None,
        }
    }
}

/// Which leg a finalize action on a B2B shipment completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum B2bPhase {
    /// Collection at the client (`isB2BColeta`)
    Coleta,
    /// Delivery to recipients (`isB2BEntrega`)
    Entrega,
}

impl B2bPhase {
    /// Classify a B2B shipment into its current leg.
    ///
    /// Delivery wins when the stored status already says the collection leg is
    /// over (`B2B_COLETA_FINALIZADA`, `B2B_ENTREGA_ACEITA`) or the shipment is
    /// tagged `B2B-2`. Otherwise a `B2B-0` tag or an accepted collection
    /// (`ACEITA`) means collection. Anything else has no finalizable leg.
    pub fn classify(
        shipment_type: Option<B2bShipmentType>,
        status: B2bShipmentStatus,
    ) -> Option<Self> {
        match (shipment_type, status) {
            (_, B2bShipmentStatus::ColetaFinalizada | B2bShipmentStatus::EntregaAceita) => {
                Some(B2bPhase::Entrega)
            }
            (Some(B2bShipmentType::Delivery), _) => Some(B2bPhase::Entrega),
            (Some(B2bShipmentType::Collection), _) | (None, B2bShipmentStatus::Aceita) => {
                Some(B2bPhase::Coleta)
            }
            _ => None,
        }
    }

    pub fn is_coleta(&self) -> bool {
        matches!(self, B2bPhase::Coleta)
    }

    pub fn is_entrega(&self) -> bool {
        matches!(self, B2bPhase::Entrega)
    }
}

/// A multi-volume B2B express shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct B2bShipment {
    pub id: B2bShipmentId,
    pub tracking_code: TrackingCode,
    pub client_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipment_type: Option<B2bShipmentType>,
    /// Stored status; see [`aggregate_status`] for what is displayed
    pub status: B2bShipmentStatus,
    pub volume_count: u32,
    pub total_weight_grams: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_date: Option<NaiveDate>,
    /// Assigned driver; cleared when the collection leg is finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl B2bShipment {
    pub fn phase(&self) -> Option<B2bPhase> {
        B2bPhase::classify(self.shipment_type, self.status)
    }
}

/// One physical volume of a B2B shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct B2bVolume {
    pub id: VolumeId,
    pub shipment_id: B2bShipmentId,
    /// 1-based position inside the shipment
    pub sequence: u32,
    /// Printed label code, once labels exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eti_code: Option<String>,
    pub weight_grams: u64,
    pub status: VolumeStatus,
    /// Recipient snapshot taken at creation time
    pub recipient: Address,
    pub updated_at: DateTime<Utc>,
}

/// Input for one volume of a new B2B shipment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVolume {
    pub weight_grams: u64,
    pub recipient: Address,
    #[serde(default)]
    pub eti_code: Option<String>,
}

/// Input for a new B2B order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewB2bShipment {
    pub client_id: Uuid,
    #[serde(default)]
    pub shipment_type: Option<B2bShipmentType>,
    #[serde(default)]
    pub delivery_date: Option<NaiveDate>,
    pub volumes: Vec<NewVolume>,
}

/// Display status of a B2B shipment, derived from its volumes.
///
/// When every volume is `ENTREGUE` or `CONCLUIDO` the shipment reads as
/// `CONCLUIDO`, whatever is stored. A shipment without volumes keeps its
/// stored status.
pub fn aggregate_status(stored: B2bShipmentStatus, volumes: &[B2bVolume]) -> B2bShipmentStatus {
    if !volumes.is_empty() && volumes.iter().all(|v| v.status.is_delivered()) {
        B2bShipmentStatus::Concluido
    } else {
        stored
    }
}

/// Read model of a B2B shipment with its volumes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct B2bShipmentView {
    pub shipment: B2bShipment,
    pub volumes: Vec<B2bVolume>,
    /// Recomputed on every read
    pub display_status: B2bShipmentStatus,
    pub display_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<B2bPhase>,
}

impl B2bShipmentView {
    pub fn new(shipment: B2bShipment, volumes: Vec<B2bVolume>) -> Self {
        let display_status = aggregate_status(shipment.status, &volumes);
        let phase = shipment.phase();
        Self {
            display_label: display_status.label().to_string(),
            display_status,
            phase,
            shipment,
            volumes,
        }
    }
}
