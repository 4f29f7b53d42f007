//! B2B shipments and their volumes
//!
//! A B2B order runs in two legs handled by different drivers. The collection
//! driver accepts the order, scans every volume and finalizes the collection,
//! which releases the order. A delivery driver then accepts it, scans the
//! dispatched volumes and finalizes the delivery with photo evidence.
//!
//! Volume statuses move independently through triage and dispatch; the status
//! shown for the order is derived from them on every read.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::domain::{
    ActorRole, B2bPhase, B2bShipment, B2bShipmentId, B2bShipmentStatus, B2bShipmentType,
    B2bShipmentView, B2bVolume, DriverId, NewB2bShipment, Occurrence, OccurrenceId,
    OccurrenceType, SessionContext, StatusHistoryEntry, StatusValue, Subject, TrackingCode,
    VolumeId, VolumeStatus,
};
use crate::infra::{
    B2bRepository, B2bTransition, DriverChange, LogisticsError, Notifier, Result,
    StatusNotification, VolumeUpdate,
};
use crate::metrics::{metric_names, MetricsRegistry};

use super::{
    ensure_assigned, ensure_can_drive, record_outcome, required_codes_for, resolve_driver,
    Completion, CompletionHook, EvidenceBundle, EvidenceFile, EvidenceUploader, InFlight,
    ScanAccepted, UploadedEvidence, ValidationRegistry, ValidationStatus,
};

const TRACKING_PREFIX: &str = "CFB";

/// Heaviest volume accepted on an order, in grams
pub const MAX_VOLUME_WEIGHT_GRAMS: u64 = 1_000_000;

/// Most volumes accepted on one order
pub const MAX_VOLUMES: usize = 10_000;

/// Whether a volume may move `from -> to`
pub fn can_transition_volume(from: VolumeStatus, to: VolumeStatus) -> bool {
    use VolumeStatus::*;
    matches!(
        (from, to),
        (AguardandoAceiteColeta, ColetaAceita)
            | (ColetaAceita, Coletado)
            | (Coletado, EmTriagem)
            | (EmTriagem, AguardandoAceiteExpedicao)
            | (AguardandoAceiteExpedicao, Expedido)
            | (Expedido, EmRota | Entregue)
            | (EmRota, Entregue)
            | (Entregue, Concluido)
            | (
                Coletado | EmTriagem | AguardandoAceiteExpedicao | Expedido | EmRota,
                Devolucao
            )
    )
}

/// Volumes taking part in a leg: accepted for collection, or dispatched for
/// delivery
pub fn participating_volumes(phase: B2bPhase, volumes: &[B2bVolume]) -> Vec<B2bVolume> {
    volumes
        .iter()
        .filter(|v| match phase {
            B2bPhase::Coleta => v.status == VolumeStatus::ColetaAceita,
            B2bPhase::Entrega => {
                matches!(v.status, VolumeStatus::Expedido | VolumeStatus::EmRota)
            }
        })
        .cloned()
        .collect()
}

/// Stored status a leg is worked from
fn leg_status(phase: B2bPhase) -> B2bShipmentStatus {
    match phase {
        B2bPhase::Coleta => B2bShipmentStatus::Aceita,
        B2bPhase::Entrega => B2bShipmentStatus::EntregaAceita,
    }
}

/// Leg a driver is currently working, if any
fn worked_leg(shipment: &B2bShipment) -> Option<B2bPhase> {
    shipment
        .phase()
        .filter(|phase| shipment.status == leg_status(*phase))
}

/// Volume statuses that close a leg. Only finalizing the leg sets them, so
/// the scan and photo checks cannot be skipped one volume at a time.
fn closes_leg(target: VolumeStatus) -> bool {
    matches!(target, VolumeStatus::Coletado | VolumeStatus::Entregue)
}

/// Engine for B2B shipments
pub struct B2bWorkflow {
    repo: Arc<dyn B2bRepository>,
    uploader: EvidenceUploader,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<MetricsRegistry>,
    validations: ValidationRegistry,
    in_flight: InFlight,
}

impl B2bWorkflow {
    pub fn new(
        repo: Arc<dyn B2bRepository>,
        uploader: EvidenceUploader,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let hook: CompletionHook = Arc::new(
            |id: B2bShipmentId, phase: B2bPhase, completion: &Completion| {
                info!(
                    shipment_id = %id,
                    ?phase,
                    codes = completion.codes.len(),
                    with_photo = completion.photo.is_some(),
                    "All volume codes validated"
                );
            },
        );
        Self::with_validations(
            repo,
            uploader,
            notifier,
            metrics,
            ValidationRegistry::with_hook(hook),
        )
    }

    /// Build with a caller-supplied registry, e.g. one whose hook records
    /// completions
    pub fn with_validations(
        repo: Arc<dyn B2bRepository>,
        uploader: EvidenceUploader,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<MetricsRegistry>,
        validations: ValidationRegistry,
    ) -> Self {
        Self {
            repo,
            uploader,
            notifier,
            metrics,
            validations,
            in_flight: InFlight::new(),
        }
    }

    async fn load(&self, id: B2bShipmentId) -> Result<B2bShipment> {
        self.repo
            .get_b2b_shipment(id)
            .await?
            .ok_or_else(|| LogisticsError::not_found("b2b_shipment", id))
    }

    async fn load_with_volumes(&self, id: B2bShipmentId) -> Result<(B2bShipment, Vec<B2bVolume>)> {
        let shipment = self.load(id).await?;
        let volumes = self.repo.volumes(id).await?;
        Ok((shipment, volumes))
    }

    /// Order with its volumes and the derived display status
    pub async fn view(&self, id: B2bShipmentId) -> Result<B2bShipmentView> {
        let (shipment, volumes) = self.load_with_volumes(id).await?;
        Ok(B2bShipmentView::new(shipment, volumes))
    }

    pub async fn history(&self, id: B2bShipmentId) -> Result<Vec<StatusHistoryEntry>> {
        self.load(id).await?;
        self.repo.b2b_history(id).await
    }

    pub async fn occurrences(&self, id: B2bShipmentId) -> Result<Vec<Occurrence>> {
        self.load(id).await?;
        self.repo.b2b_occurrences(id).await
    }

    /// Create an order with its volumes
    #[instrument(skip(self, session, input), fields(actor = %session.describe(), volumes = input.volumes.len()))]
    pub async fn create_b2b_shipment(
        &self,
        session: &SessionContext,
        input: NewB2bShipment,
    ) -> Result<B2bShipmentView> {
        let allowed = session.is_admin()
            || (session.role == ActorRole::B2bClient && session.actor_id == input.client_id);
        if !allowed {
            return Err(LogisticsError::Forbidden(format!(
                "{} cannot create orders for client {}",
                session.describe(),
                input.client_id
            )));
        }
        if input.volumes.is_empty() {
            return Err(LogisticsError::InvalidInput(
                "an order needs at least one volume".to_string(),
            ));
        }
        if input.volumes.len() > MAX_VOLUMES {
            return Err(LogisticsError::InvalidInput(format!(
                "an order holds at most {MAX_VOLUMES} volumes"
            )));
        }

        let id = B2bShipmentId::new();
        let now = Utc::now();
        let initial = match input.shipment_type {
            Some(B2bShipmentType::Delivery) => VolumeStatus::AguardandoAceiteExpedicao,
            _ => VolumeStatus::AguardandoAceiteColeta,
        };

        let mut seen = HashSet::new();
        let mut total_weight_grams: u64 = 0;
        let mut volumes = Vec::with_capacity(input.volumes.len());
        for (index, new_volume) in input.volumes.into_iter().enumerate() {
            let sequence = index as u32 + 1;
            if new_volume.weight_grams == 0 || new_volume.weight_grams > MAX_VOLUME_WEIGHT_GRAMS {
                return Err(LogisticsError::InvalidInput(format!(
                    "volumes[{index}].weight_grams must be between 1 and {MAX_VOLUME_WEIGHT_GRAMS}"
                )));
            }
            total_weight_grams = total_weight_grams
                .checked_add(new_volume.weight_grams)
                .ok_or_else(|| {
                    LogisticsError::InvalidInput("total weight is out of range".to_string())
                })?;
            let recipient = new_volume.recipient.normalized();
            recipient.validate().map_err(|field| {
                LogisticsError::InvalidInput(format!("volumes[{index}].recipient.{field}"))
            })?;
            let eti_code = new_volume
                .eti_code
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty());
            if let Some(code) = &eti_code {
                if !seen.insert(code.to_lowercase()) {
                    return Err(LogisticsError::DuplicateCode(code.clone()));
                }
            }
            volumes.push(B2bVolume {
                id: VolumeId::new(),
                shipment_id: id,
                sequence,
                eti_code,
                weight_grams: new_volume.weight_grams,
                status: initial,
                recipient,
                updated_at: now,
            });
        }

        let shipment = B2bShipment {
            id,
            tracking_code: TrackingCode::generate(TRACKING_PREFIX),
            client_id: input.client_id,
            shipment_type: input.shipment_type,
            status: B2bShipmentStatus::Pendente,
            volume_count: volumes.len() as u32,
            total_weight_grams,
            delivery_date: input.delivery_date,
            driver_id: None,
            created_at: now,
            updated_at: now,
        };
        let history = StatusHistoryEntry::new(
            Subject::B2bShipment(id),
            StatusValue::B2bShipment(shipment.status),
            session.describe(),
            None,
        );
        self.repo
            .insert_b2b_shipment(&shipment, &volumes, &history)
            .await?;

        info!(
            shipment_id = %id,
            tracking_code = %shipment.tracking_code,
            volumes = volumes.len(),
            "B2B order created"
        );
        Ok(B2bShipmentView::new(shipment, volumes))
    }

    /// Collection driver takes the order
    #[instrument(skip(self, session), fields(actor = %session.describe()))]
    pub async fn accept_collection(
        &self,
        session: &SessionContext,
        id: B2bShipmentId,
        assign_to: Option<DriverId>,
    ) -> Result<B2bShipmentView> {
        let driver = resolve_driver(session, assign_to)?;
        let _permit = self.in_flight.acquire(id.0)?;
        let (shipment, volumes) = self.load_with_volumes(id).await?;

        let next = B2bShipmentStatus::Aceita;
        let acceptable = shipment.status == B2bShipmentStatus::Pendente
            && shipment.driver_id.is_none()
            && shipment.shipment_type != Some(B2bShipmentType::Delivery);
        if !acceptable {
            return self.reject(&shipment, next).await;
        }

        let updates = move_volumes(
            &volumes,
            VolumeStatus::AguardandoAceiteColeta,
            VolumeStatus::ColetaAceita,
        );
        self.apply_accept(session, &shipment, next, driver, updates)
            .await
    }

    /// Delivery driver takes the order once collection is over, or directly
    /// for delivery-only orders
    #[instrument(skip(self, session), fields(actor = %session.describe()))]
    pub async fn accept_delivery(
        &self,
        session: &SessionContext,
        id: B2bShipmentId,
        assign_to: Option<DriverId>,
    ) -> Result<B2bShipmentView> {
        let driver = resolve_driver(session, assign_to)?;
        let _permit = self.in_flight.acquire(id.0)?;
        let (shipment, volumes) = self.load_with_volumes(id).await?;

        let next = B2bShipmentStatus::EntregaAceita;
        let from_ok = match shipment.status {
            B2bShipmentStatus::ColetaFinalizada => true,
            B2bShipmentStatus::Pendente => {
                shipment.shipment_type == Some(B2bShipmentType::Delivery)
            }
            _ => false,
        };
        if !from_ok || shipment.driver_id.is_some() {
            return self.reject(&shipment, next).await;
        }

        let updates = move_volumes(
            &volumes,
            VolumeStatus::AguardandoAceiteExpedicao,
            VolumeStatus::Expedido,
        );
        self.apply_accept(session, &shipment, next, driver, updates)
            .await
    }

    async fn apply_accept(
        &self,
        session: &SessionContext,
        shipment: &B2bShipment,
        next: B2bShipmentStatus,
        driver: DriverId,
        volumes: Vec<VolumeUpdate>,
    ) -> Result<B2bShipmentView> {
        let transition = B2bTransition {
            shipment_id: shipment.id,
            expected: shipment.status,
            next,
            driver: DriverChange::Assign(driver),
            volumes,
            occurrences: Vec::new(),
            history: StatusHistoryEntry::new(
                Subject::B2bShipment(shipment.id),
                StatusValue::B2bShipment(next),
                session.describe(),
                Some(driver),
            ),
        };
        self.apply(session, shipment, transition, &UploadedEvidence::default())
            .await?;
        self.validations.evict(shipment.id).await;
        self.view(shipment.id).await
    }

    /// Move one volume along the volume table
    #[instrument(skip(self, session), fields(actor = %session.describe()))]
    pub async fn advance_volume(
        &self,
        session: &SessionContext,
        volume_id: VolumeId,
        target: VolumeStatus,
    ) -> Result<B2bVolume> {
        let volume = self
            .repo
            .get_volume(volume_id)
            .await?
            .ok_or_else(|| LogisticsError::not_found("b2b_volume", volume_id))?;
        let parent = self.load(volume.shipment_id).await?;

        let driver_id = if session.is_admin() {
            parent.driver_id
        } else {
            ensure_can_drive(session)?;
            Some(ensure_assigned(session, parent.driver_id, parent.id)?)
        };

        if !can_transition_volume(volume.status, target) {
            self.metrics
                .inc_counter(metric_names::TRANSITIONS_REJECTED)
                .await;
            return Err(LogisticsError::invalid_state(
                "b2b_volume",
                volume_id,
                volume.status,
                target,
            ));
        }
        if closes_leg(target) {
            self.metrics
                .inc_counter(metric_names::TRANSITIONS_REJECTED)
                .await;
            if worked_leg(&parent).is_some() {
                return Err(LogisticsError::invalid_state(
                    "b2b_volume",
                    volume_id,
                    volume.status,
                    format!("{target} (set by finalizing {})", parent.status),
                ));
            }
            if !session.is_admin() {
                return Err(LogisticsError::Forbidden(format!(
                    "drivers cannot set {target} on a single volume"
                )));
            }
        }

        let update = VolumeUpdate {
            volume_id,
            expected: volume.status,
            next: target,
        };
        let history = StatusHistoryEntry::new(
            Subject::Volume(volume_id),
            StatusValue::Volume(target),
            session.describe(),
            driver_id,
        );
        let result = self.repo.apply_volume_update(update, history).await;
        record_outcome(&self.metrics, &result).await;
        let updated = result?;
        self.prune_validations(&parent).await?;

        info!(
            volume_id = %volume_id,
            shipment_id = %parent.id,
            from = %volume.status,
            to = %updated.status,
            "Volume transition applied"
        );
        self.notifier
            .notify(StatusNotification::new(
                Subject::Volume(volume_id),
                parent.tracking_code.as_str(),
                Some(StatusValue::Volume(volume.status)),
                StatusValue::Volume(updated.status),
                session.describe(),
            ))
            .await;
        Ok(updated)
    }

    /// Drop validation state that no longer matches the order's volumes
    async fn prune_validations(&self, shipment: &B2bShipment) -> Result<()> {
        let worked = worked_leg(shipment);
        let required = match worked {
            Some(phase) => {
                let volumes = self.repo.volumes(shipment.id).await?;
                required_codes_for(&participating_volumes(phase, &volumes))
            }
            None => Vec::new(),
        };
        self.validations.prune(shipment.id, worked, &required).await;
        Ok(())
    }

    /// Codes the driver must scan for the order's current leg
    pub async fn required_codes(&self, id: B2bShipmentId) -> Result<Vec<String>> {
        let (shipment, volumes) = self.load_with_volumes(id).await?;
        Ok(match shipment.phase() {
            Some(phase) => required_codes_for(&participating_volumes(phase, &volumes)),
            None => required_codes_for(&volumes),
        })
    }

    /// Leg being worked, checked against the stored status and the actor
    fn active_leg(&self, session: &SessionContext, shipment: &B2bShipment) -> Result<B2bPhase> {
        let phase = shipment.phase().ok_or_else(|| {
            LogisticsError::invalid_state(
                "b2b_shipment",
                shipment.id,
                shipment.status,
                "a collection or delivery leg",
            )
        })?;
        if shipment.status != leg_status(phase) {
            return Err(LogisticsError::invalid_state(
                "b2b_shipment",
                shipment.id,
                shipment.status,
                leg_status(phase),
            ));
        }
        ensure_assigned(session, shipment.driver_id, shipment.id)?;
        Ok(phase)
    }

    /// Submit one scanned or typed code for the current leg
    #[instrument(skip(self, session, photo), fields(actor = %session.describe()))]
    pub async fn scan_code(
        &self,
        session: &SessionContext,
        id: B2bShipmentId,
        code: &str,
        photo: Option<EvidenceFile>,
    ) -> Result<ScanAccepted> {
        ensure_can_drive(session)?;
        let (shipment, volumes) = self.load_with_volumes(id).await?;
        let phase = self.active_leg(session, &shipment)?;
        let required = required_codes_for(&participating_volumes(phase, &volumes));

        let result = self
            .validations
            .scan(id, phase, &required, code, photo)
            .await;
        let counter = if result.is_ok() {
            metric_names::CODES_ACCEPTED
        } else {
            metric_names::CODES_REJECTED
        };
        self.metrics.inc_counter(counter).await;
        if let Err(e) = &result {
            warn!(shipment_id = %id, code, error = %e, "Code rejected");
        }
        result
    }

    pub async fn validation_status(&self, id: B2bShipmentId) -> Result<ValidationStatus> {
        let (shipment, volumes) = self.load_with_volumes(id).await?;
        let phase = shipment.phase().ok_or_else(|| {
            LogisticsError::invalid_state(
                "b2b_shipment",
                id,
                shipment.status,
                "a collection or delivery leg",
            )
        })?;
        let required = required_codes_for(&participating_volumes(phase, &volumes));
        if worked_leg(&shipment).is_none() {
            self.validations.evict(id).await;
        }
        Ok(self.validations.status(id, phase, &required).await)
    }

    /// Finalize the current leg.
    ///
    /// Every participating volume must be validated first. Delivery needs at
    /// least one photo; collection evidence is optional. Finalizing the
    /// collection releases the driver so another one can take the delivery.
    #[instrument(skip(self, session, evidence), fields(actor = %session.describe(), photos = evidence.photos.len()))]
    pub async fn finalize_coleta_ou_entrega(
        &self,
        session: &SessionContext,
        id: B2bShipmentId,
        mut evidence: EvidenceBundle,
    ) -> Result<B2bShipmentView> {
        ensure_can_drive(session)?;
        let start = Instant::now();
        let _permit = self.in_flight.acquire(id.0)?;
        let (shipment, volumes) = self.load_with_volumes(id).await?;

        let phase = shipment.phase().ok_or_else(|| {
            LogisticsError::invalid_state(
                "b2b_shipment",
                id,
                shipment.status,
                "a collection or delivery leg",
            )
        })?;

        if let Some(photo) = self.validations.completion_photo(id, phase).await {
            if !evidence.photos.contains(&photo) {
                evidence.photos.push(photo);
            }
        }
        if phase.is_entrega() && !evidence.has_photos() {
            return Err(LogisticsError::EvidenceRequired(format!(
                "delivery of {id} needs at least one photo"
            )));
        }

        let driver = match self.active_leg(session, &shipment) {
            Ok(_) => shipment.driver_id,
            Err(e) => {
                self.metrics
                    .inc_counter(metric_names::TRANSITIONS_REJECTED)
                    .await;
                return Err(e);
            }
        };

        let participating = participating_volumes(phase, &volumes);
        if participating.is_empty() {
            return Err(LogisticsError::invalid_state(
                "b2b_shipment",
                id,
                shipment.status,
                "finalized without volumes in the leg",
            ));
        }
        let required = required_codes_for(&participating);
        let status = self.validations.status(id, phase, &required).await;
        if !status.complete {
            return Err(LogisticsError::ValidationIncomplete {
                scanned: status.scanned(),
                required: required.len(),
            });
        }

        let uploaded = self.uploader.upload(id.0, &evidence).await?;

        let (next, kind, volume_next, driver_change) = match phase {
            B2bPhase::Coleta => (
                B2bShipmentStatus::ColetaFinalizada,
                OccurrenceType::ColetaFinalizada,
                VolumeStatus::Coletado,
                DriverChange::Clear,
            ),
            B2bPhase::Entrega => (
                B2bShipmentStatus::Entregue,
                OccurrenceType::EntregaFinalizada,
                VolumeStatus::Entregue,
                DriverChange::Keep,
            ),
        };
        let now = Utc::now();
        let occurrences = uploaded
            .photos
            .iter()
            .enumerate()
            .map(|(i, photo)| Occurrence {
                id: OccurrenceId::new(),
                subject: Subject::B2bShipment(id),
                kind,
                description: kind.default_description().to_string(),
                observations: None,
                resulting_status: StatusValue::B2bShipment(next),
                photo_url: Some(photo.url.clone()),
                signature_url: if i == 0 { uploaded.signature_url() } else { None },
                driver_id: driver,
                created_at: now,
            })
            .collect();
        let transition = B2bTransition {
            shipment_id: id,
            expected: shipment.status,
            next,
            driver: driver_change,
            volumes: participating
                .iter()
                .map(|v| VolumeUpdate {
                    volume_id: v.id,
                    expected: v.status,
                    next: volume_next,
                })
                .collect(),
            occurrences,
            history: StatusHistoryEntry::new(
                Subject::B2bShipment(id),
                StatusValue::B2bShipment(next),
                session.describe(),
                driver,
            ),
        };

        let result = self
            .apply(session, &shipment, transition, &uploaded)
            .await;
        self.metrics
            .observe_histogram(metric_names::FINALIZE_LATENCY, start.elapsed().as_secs_f64())
            .await;
        result?;

        self.validations.reset(id, phase).await;
        self.view(id).await
    }

    async fn reject(
        &self,
        shipment: &B2bShipment,
        next: B2bShipmentStatus,
    ) -> Result<B2bShipmentView> {
        self.metrics
            .inc_counter(metric_names::TRANSITIONS_REJECTED)
            .await;
        let from = match shipment.driver_id {
            Some(driver) => format!("{} (driver {driver})", shipment.status),
            None => shipment.status.to_string(),
        };
        Err(LogisticsError::invalid_state(
            "b2b_shipment",
            shipment.id,
            from,
            next,
        ))
    }

    async fn apply(
        &self,
        session: &SessionContext,
        before: &B2bShipment,
        transition: B2bTransition,
        uploaded: &UploadedEvidence,
    ) -> Result<B2bShipment> {
        let result = self
            .uploader
            .commit_or_compensate(uploaded, self.repo.apply_b2b_transition(transition))
            .await;
        record_outcome(&self.metrics, &result).await;

        match &result {
            Ok(updated) => {
                info!(
                    shipment_id = %updated.id,
                    from = %before.status,
                    to = %updated.status,
                    actor = %session.describe(),
                    "B2B transition applied"
                );
                self.notifier
                    .notify(StatusNotification::new(
                        Subject::B2bShipment(updated.id),
                        updated.tracking_code.as_str(),
                        Some(StatusValue::B2bShipment(before.status)),
                        StatusValue::B2bShipment(updated.status),
                        session.describe(),
                    ))
                    .await;
            }
            Err(e) => {
                warn!(shipment_id = %before.id, from = %before.status, error = %e, "B2B transition failed");
            }
        }
        result
    }
}

fn move_volumes(volumes: &[B2bVolume], from: VolumeStatus, to: VolumeStatus) -> Vec<VolumeUpdate> {
    volumes
        .iter()
        .filter(|v| v.status == from)
        .map(|v| VolumeUpdate {
            volume_id: v.id,
            expected: from,
            next: to,
        })
        .collect()
}
