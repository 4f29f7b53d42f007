//! In-memory repositories
//!
//! Used when no `DATABASE_URL` is configured and by the test suites. A
//! single write lock covers each transition, so every transition is atomic
//! and its status check is a real compare-and-swap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::domain::{
    B2bShipment, B2bShipmentId, B2bVolume, Occurrence, Shipment, ShipmentId, StatusHistoryEntry,
    Subject, VolumeId,
};

use super::{
    B2bRepository, B2bTransition, ComponentHealth, HealthCheck, LogisticsError, Result,
    ShipmentRepository, ShipmentTransition, VolumeUpdate,
};

#[derive(Default)]
struct MemoryState {
    shipments: HashMap<ShipmentId, Shipment>,
    b2b_shipments: HashMap<B2bShipmentId, B2bShipment>,
    volumes: HashMap<VolumeId, B2bVolume>,
    history: Vec<StatusHistoryEntry>,
    occurrences: Vec<Occurrence>,
}

impl MemoryState {
    fn volume_ids(&self, shipment_id: B2bShipmentId) -> Vec<VolumeId> {
        self.volumes
            .values()
            .filter(|v| v.shipment_id == shipment_id)
            .map(|v| v.id)
            .collect()
    }

    fn belongs_to_b2b(&self, subject: &Subject, shipment_id: B2bShipmentId) -> bool {
        match subject {
            Subject::B2bShipment(id) => *id == shipment_id,
            Subject::Volume(id) => self
                .volumes
                .get(id)
                .is_some_and(|v| v.shipment_id == shipment_id),
            Subject::Shipment(_) => false,
        }
    }
}

/// Shipment and B2B store held in process memory
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent transition fail with a persistence error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LogisticsError::Persistence(
                "write rejected by storage".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of history rows across all records
    pub async fn history_len(&self) -> usize {
        self.state.read().await.history.len()
    }

    /// Number of occurrence rows across all records
    pub async fn occurrence_len(&self) -> usize {
        self.state.read().await.occurrences.len()
    }
}

#[async_trait]
impl ShipmentRepository for InMemoryStore {
    #[instrument(skip(self, shipment, history), fields(shipment_id = %shipment.id))]
    async fn insert_shipment(
        &self,
        shipment: &Shipment,
        history: &StatusHistoryEntry,
    ) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if state.shipments.contains_key(&shipment.id) {
            return Err(LogisticsError::InvalidInput(format!(
                "shipment {} already exists",
                shipment.id
            )));
        }
        state.shipments.insert(shipment.id, shipment.clone());
        state.history.push(history.clone());
        Ok(())
    }

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>> {
        Ok(self.state.read().await.shipments.get(&id).cloned())
    }

    #[instrument(skip(self, transition), fields(shipment_id = %transition.shipment_id))]
    async fn apply_shipment_transition(&self, transition: ShipmentTransition) -> Result<Shipment> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        let shipment = state
            .shipments
            .get_mut(&transition.shipment_id)
            .ok_or_else(|| LogisticsError::not_found("shipment", transition.shipment_id))?;

        if shipment.status != transition.expected {
            return Err(LogisticsError::stale(
                "shipment",
                transition.shipment_id,
                transition.expected,
                shipment.status,
            ));
        }

        shipment.status = transition.next;
        shipment.driver_id = transition.driver.apply(shipment.driver_id);
        shipment.updated_at = Utc::now();
        let updated = shipment.clone();

        state.occurrences.extend(transition.occurrences);
        state.history.push(transition.history);
        Ok(updated)
    }

    async fn shipment_history(&self, id: ShipmentId) -> Result<Vec<StatusHistoryEntry>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.subject == Subject::Shipment(id))
            .cloned()
            .collect())
    }

    async fn shipment_occurrences(&self, id: ShipmentId) -> Result<Vec<Occurrence>> {
        let state = self.state.read().await;
        Ok(state
            .occurrences
            .iter()
            .filter(|o| o.subject == Subject::Shipment(id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl B2bRepository for InMemoryStore {
    #[instrument(skip_all, fields(shipment_id = %shipment.id, volumes = volumes.len()))]
    async fn insert_b2b_shipment(
        &self,
        shipment: &B2bShipment,
        volumes: &[B2bVolume],
        history: &StatusHistoryEntry,
    ) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if state.b2b_shipments.contains_key(&shipment.id) {
            return Err(LogisticsError::InvalidInput(format!(
                "b2b shipment {} already exists",
                shipment.id
            )));
        }
        state.b2b_shipments.insert(shipment.id, shipment.clone());
        for volume in volumes {
            state.volumes.insert(volume.id, volume.clone());
        }
        state.history.push(history.clone());
        Ok(())
    }

    async fn get_b2b_shipment(&self, id: B2bShipmentId) -> Result<Option<B2bShipment>> {
        Ok(self.state.read().await.b2b_shipments.get(&id).cloned())
    }

    async fn volumes(&self, id: B2bShipmentId) -> Result<Vec<B2bVolume>> {
        let state = self.state.read().await;
        let mut volumes: Vec<B2bVolume> = state
            .volumes
            .values()
            .filter(|v| v.shipment_id == id)
            .cloned()
            .collect();
        volumes.sort_by_key(|v| v.sequence);
        Ok(volumes)
    }

    async fn get_volume(&self, id: VolumeId) -> Result<Option<B2bVolume>> {
        Ok(self.state.read().await.volumes.get(&id).cloned())
    }

    #[instrument(skip(self, transition), fields(shipment_id = %transition.shipment_id))]
    async fn apply_b2b_transition(&self, transition: B2bTransition) -> Result<B2bShipment> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        let current = state
            .b2b_shipments
            .get(&transition.shipment_id)
            .ok_or_else(|| LogisticsError::not_found("b2b_shipment", transition.shipment_id))?;
        if current.status != transition.expected {
            return Err(LogisticsError::stale(
                "b2b_shipment",
                transition.shipment_id,
                transition.expected,
                current.status,
            ));
        }

        // Check every volume before touching anything
        let owned = state.volume_ids(transition.shipment_id);
        for update in &transition.volumes {
            let volume = state
                .volumes
                .get(&update.volume_id)
                .filter(|_| owned.contains(&update.volume_id))
                .ok_or_else(|| LogisticsError::not_found("b2b_volume", update.volume_id))?;
            if volume.status != update.expected {
                return Err(LogisticsError::stale(
                    "b2b_volume",
                    update.volume_id,
                    update.expected,
                    volume.status,
                ));
            }
        }

        let now = Utc::now();
        for update in &transition.volumes {
            if let Some(volume) = state.volumes.get_mut(&update.volume_id) {
                volume.status = update.next;
                volume.updated_at = now;
            }
        }

        let updated = match state.b2b_shipments.get_mut(&transition.shipment_id) {
            Some(shipment) => {
                shipment.status = transition.next;
                shipment.driver_id = transition.driver.apply(shipment.driver_id);
                shipment.updated_at = now;
                shipment.clone()
            }
            None => return Err(LogisticsError::not_found("b2b_shipment", transition.shipment_id)),
        };

        state.occurrences.extend(transition.occurrences);
        state.history.push(transition.history);
        Ok(updated)
    }

    #[instrument(skip(self, history), fields(volume_id = %update.volume_id))]
    async fn apply_volume_update(
        &self,
        update: VolumeUpdate,
        history: StatusHistoryEntry,
    ) -> Result<B2bVolume> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        let volume = state
            .volumes
            .get_mut(&update.volume_id)
            .ok_or_else(|| LogisticsError::not_found("b2b_volume", update.volume_id))?;
        if volume.status != update.expected {
            return Err(LogisticsError::stale(
                "b2b_volume",
                update.volume_id,
                update.expected,
                volume.status,
            ));
        }

        volume.status = update.next;
        volume.updated_at = Utc::now();
        let updated = volume.clone();
        state.history.push(history);
        Ok(updated)
    }

    async fn b2b_history(&self, id: B2bShipmentId) -> Result<Vec<StatusHistoryEntry>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|h| state.belongs_to_b2b(&h.subject, id))
            .cloned()
            .collect())
    }

    async fn b2b_occurrences(&self, id: B2bShipmentId) -> Result<Vec<Occurrence>> {
        let state = self.state.read().await;
        Ok(state
            .occurrences
            .iter()
            .filter(|o| state.belongs_to_b2b(&o.subject, id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HealthCheck for InMemoryStore {
    async fn check_health(&self) -> ComponentHealth {
        ComponentHealth::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Address, B2bShipmentStatus, Package, PackageFormat, PickupOption, ShipmentOwner,
        ShipmentStatus, StatusValue, TrackingCode, VolumeStatus,
    };
    use crate::infra::DriverChange;
    use uuid::Uuid;

    fn address() -> Address {
        Address {
            name: "Ana".into(),
            street: "Rua A".into(),
            number: "1".into(),
            complement: None,
            district: "Centro".into(),
            city: "Recife".into(),
            state: "PE".into(),
            postal_code: "50010000".into(),
            phone: None,
        }
    }

    fn shipment(status: ShipmentStatus) -> Shipment {
        let now = Utc::now();
        Shipment {
            id: ShipmentId::new(),
            tracking_code: TrackingCode::generate("CF"),
            status,
            sender: address(),
            recipient: address(),
            package: Package {
                weight_grams: 1000,
                length_cm: 10,
                width_cm: 10,
                height_cm: 10,
                format: PackageFormat::Box,
            },
            service: "standard".into(),
            pickup: PickupOption::Collect,
            price_cents: 2500,
            document: None,
            driver_id: None,
            owner: ShipmentOwner::User(Uuid::new_v4()),
            created_at: now,
            updated_at: now,
        }
    }

    fn history_for(id: ShipmentId, status: ShipmentStatus) -> StatusHistoryEntry {
        StatusHistoryEntry::new(
            Subject::Shipment(id),
            StatusValue::Shipment(status),
            "test",
            None,
        )
    }

    #[tokio::test]
    async fn test_transition_is_conditional_on_expected_status() {
        let store = InMemoryStore::new();
        let s = shipment(ShipmentStatus::EmTransito);
        store
            .insert_shipment(&s, &history_for(s.id, s.status))
            .await
            .unwrap();

        let stale = ShipmentTransition {
            shipment_id: s.id,
            expected: ShipmentStatus::ColetaAceita,
            next: ShipmentStatus::ColetaFinalizada,
            driver: DriverChange::Keep,
            occurrences: vec![],
            history: history_for(s.id, ShipmentStatus::ColetaFinalizada),
        };
        let err = store.apply_shipment_transition(stale).await.unwrap_err();
        assert!(err.is_conflict());
        // Nothing was written by the rejected transition
        assert_eq!(store.shipment_history(s.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_trace() {
        let store = InMemoryStore::new();
        let s = shipment(ShipmentStatus::EmTransito);
        store
            .insert_shipment(&s, &history_for(s.id, s.status))
            .await
            .unwrap();

        store.fail_writes(true);
        let transition = ShipmentTransition {
            shipment_id: s.id,
            expected: ShipmentStatus::EmTransito,
            next: ShipmentStatus::EntregaFinalizada,
            driver: DriverChange::Keep,
            occurrences: vec![],
            history: history_for(s.id, ShipmentStatus::EntregaFinalizada),
        };
        assert!(matches!(
            store.apply_shipment_transition(transition).await,
            Err(LogisticsError::Persistence(_))
        ));
        let stored = store.get_shipment(s.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ShipmentStatus::EmTransito);
    }

    #[tokio::test]
    async fn test_b2b_transition_checks_all_volumes_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let shipment = B2bShipment {
            id: B2bShipmentId::new(),
            tracking_code: TrackingCode::generate("B2"),
            client_id: Uuid::new_v4(),
            shipment_type: None,
            status: B2bShipmentStatus::Aceita,
            volume_count: 2,
            total_weight_grams: 2000,
            delivery_date: None,
            driver_id: None,
            created_at: now,
            updated_at: now,
        };
        let volumes: Vec<B2bVolume> = [VolumeStatus::ColetaAceita, VolumeStatus::Devolucao]
            .into_iter()
            .enumerate()
            .map(|(i, status)| B2bVolume {
                id: VolumeId::new(),
                shipment_id: shipment.id,
                sequence: i as u32 + 1,
                eti_code: None,
                weight_grams: 1000,
                status,
                recipient: address(),
                updated_at: now,
            })
            .collect();
        let history = StatusHistoryEntry::new(
            Subject::B2bShipment(shipment.id),
            StatusValue::B2bShipment(shipment.status),
            "test",
            None,
        );
        store
            .insert_b2b_shipment(&shipment, &volumes, &history)
            .await
            .unwrap();

        let transition = B2bTransition {
            shipment_id: shipment.id,
            expected: B2bShipmentStatus::Aceita,
            next: B2bShipmentStatus::ColetaFinalizada,
            driver: DriverChange::Clear,
            volumes: volumes
                .iter()
                .map(|v| VolumeUpdate {
                    volume_id: v.id,
                    expected: VolumeStatus::ColetaAceita,
                    next: VolumeStatus::Coletado,
                })
                .collect(),
            occurrences: vec![],
            history: history.clone(),
        };
        assert!(store.apply_b2b_transition(transition).await.is_err());

        let stored = store.volumes(shipment.id).await.unwrap();
        assert_eq!(stored[0].status, VolumeStatus::ColetaAceita);
        assert_eq!(
            store.get_b2b_shipment(shipment.id).await.unwrap().unwrap().status,
            B2bShipmentStatus::Aceita
        );
    }
}
