//! Single-shipment state machine
//!
//! ```text
//! PENDING_LABEL -> LABEL_GENERATED -> PENDING_DOCUMENT -> PENDING_PAYMENT
//!   -> PAYMENT_CONFIRMED -> COLETA_ACEITA -> COLETA_FINALIZADA -> EM_TRANSITO
//!   -> ENTREGA_FINALIZADA
//! ```
//!
//! `TENTATIVA_ENTREGA` loops back to `EM_TRANSITO`. `ENDERECO_INCORRETO` and
//! `AGUARDANDO_DESTINATARIO` stall the shipment until an operator moves it back
//! into transit.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::domain::{
    DriverId, NewShipment, Occurrence, OccurrenceId, OccurrenceType, SessionContext, Shipment,
    ShipmentId, ShipmentOwner, ShipmentStatus, StatusHistoryEntry, StatusValue, Subject,
    TrackingCode,
};
use crate::infra::{
    DriverChange, LogisticsError, Notifier, Result, ShipmentRepository, ShipmentTransition,
    StatusNotification,
};
use crate::metrics::{metric_names, MetricsRegistry};

use super::{
    ensure_assigned, ensure_can_drive, record_outcome, resolve_driver, EvidenceBundle,
    EvidenceUploader, InFlight, UploadedEvidence,
};

const TRACKING_PREFIX: &str = "CF";

/// Whether `from -> to` is an edge of the shipment machine
pub fn can_transition(from: ShipmentStatus, to: ShipmentStatus) -> bool {
    use ShipmentStatus::*;
    matches!(
        (from, to),
        (PendingLabel, LabelGenerated)
            | (LabelGenerated, PendingDocument)
            | (PendingDocument, PendingPayment)
            | (PendingPayment, PaymentConfirmed)
            | (PendingLabel | LabelGenerated | PaymentConfirmed, ColetaAceita)
            | (ColetaAceita, ColetaFinalizada)
            | (ColetaFinalizada, EmTransito)
            | (
                EmTransito | TentativaEntrega,
                EntregaFinalizada | TentativaEntrega | EnderecoIncorreto | AguardandoDestinatario
            )
            | (TentativaEntrega | EnderecoIncorreto | AguardandoDestinatario, EmTransito)
    )
}

/// States a driver may accept a pickup from
pub fn can_accept_pickup(status: ShipmentStatus) -> bool {
    matches!(
        status,
        ShipmentStatus::PendingLabel | ShipmentStatus::LabelGenerated
    )
}

/// States a delivery may be finalized from
pub fn can_finalize_delivery(status: ShipmentStatus) -> bool {
    matches!(
        status,
        ShipmentStatus::EmTransito | ShipmentStatus::TentativaEntrega
    )
}

/// Targets a driver may set through `advance_status`
fn driver_may_advance_to(target: ShipmentStatus) -> bool {
    matches!(
        target,
        ShipmentStatus::ColetaFinalizada
            | ShipmentStatus::EmTransito
            | ShipmentStatus::EnderecoIncorreto
            | ShipmentStatus::AguardandoDestinatario
    )
}

/// Occurrence submitted by a driver, admin or the owning customer
#[derive(Debug, Clone)]
pub struct OccurrenceInput {
    pub kind: OccurrenceType,
    pub description: Option<String>,
    pub observations: Option<String>,
    pub evidence: EvidenceBundle,
}

impl OccurrenceInput {
    pub fn new(kind: OccurrenceType) -> Self {
        Self {
            kind,
            description: None,
            observations: None,
            evidence: EvidenceBundle::default(),
        }
    }

    pub fn with_observations(mut self, observations: impl Into<String>) -> Self {
        self.observations = Some(observations.into());
        self
    }

    pub fn with_evidence(mut self, evidence: EvidenceBundle) -> Self {
        self.evidence = evidence;
        self
    }

    fn trimmed_observations(&self) -> Option<String> {
        self.observations
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Shipment after an occurrence was recorded, with the occurrence itself
#[derive(Debug, Clone)]
pub struct RecordedOccurrence {
    pub shipment: Shipment,
    pub occurrence: Occurrence,
}

/// Engine for single (non-B2B) shipments
pub struct ShipmentWorkflow {
    repo: Arc<dyn ShipmentRepository>,
    uploader: EvidenceUploader,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<MetricsRegistry>,
    in_flight: InFlight,
}

impl ShipmentWorkflow {
    pub fn new(
        repo: Arc<dyn ShipmentRepository>,
        uploader: EvidenceUploader,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            repo,
            uploader,
            notifier,
            metrics,
            in_flight: InFlight::new(),
        }
    }

    async fn load(&self, id: ShipmentId) -> Result<Shipment> {
        self.repo
            .get_shipment(id)
            .await?
            .ok_or_else(|| LogisticsError::not_found("shipment", id))
    }

    pub async fn get_shipment(&self, id: ShipmentId) -> Result<Shipment> {
        self.load(id).await
    }

    pub async fn history(&self, id: ShipmentId) -> Result<Vec<StatusHistoryEntry>> {
        self.load(id).await?;
        self.repo.shipment_history(id).await
    }

    pub async fn occurrences(&self, id: ShipmentId) -> Result<Vec<Occurrence>> {
        self.load(id).await?;
        self.repo.shipment_occurrences(id).await
    }

    /// Promote a checkout into a shipment awaiting its label
    #[instrument(skip(self, session, input), fields(actor = %session.describe()))]
    pub async fn create_shipment(
        &self,
        session: &SessionContext,
        input: NewShipment,
    ) -> Result<Shipment> {
        let sender = input.sender.normalized();
        let recipient = input.recipient.normalized();
        sender
            .validate()
            .map_err(|field| LogisticsError::InvalidInput(format!("sender.{field}")))?;
        recipient
            .validate()
            .map_err(|field| LogisticsError::InvalidInput(format!("recipient.{field}")))?;

        let package = &input.package;
        if package.weight_grams == 0
            || package.length_cm == 0
            || package.width_cm == 0
            || package.height_cm == 0
        {
            return Err(LogisticsError::InvalidInput(
                "package weight and dimensions must be positive".to_string(),
            ));
        }
        if input.service.trim().is_empty() {
            return Err(LogisticsError::InvalidInput("service is required".to_string()));
        }
        if input.price_cents < 0 {
            return Err(LogisticsError::InvalidInput(
                "price cannot be negative".to_string(),
            ));
        }

        let now = Utc::now();
        let shipment = Shipment {
            id: ShipmentId::new(),
            tracking_code: TrackingCode::generate(TRACKING_PREFIX),
            status: ShipmentStatus::PendingLabel,
            sender,
            recipient,
            package: input.package,
            service: input.service.trim().to_string(),
            pickup: input.pickup,
            price_cents: input.price_cents,
            document: input.document,
            driver_id: None,
            owner: ShipmentOwner::from_session(session),
            created_at: now,
            updated_at: now,
        };
        let history = StatusHistoryEntry::new(
            Subject::Shipment(shipment.id),
            StatusValue::Shipment(shipment.status),
            session.describe(),
            None,
        );
        self.repo.insert_shipment(&shipment, &history).await?;

        info!(
            shipment_id = %shipment.id,
            tracking_code = %shipment.tracking_code,
            billable_weight_grams = shipment.package.billable_weight_grams(),
            "Shipment created"
        );
        Ok(shipment)
    }

    /// Move a shipment along the table on behalf of an admin or its driver.
    ///
    /// Finalized delivery and failed attempts carry evidence or observations
    /// and go through `finalize_delivery` / `register_occurrence` instead.
    #[instrument(skip(self, session), fields(actor = %session.describe()))]
    pub async fn advance_status(
        &self,
        session: &SessionContext,
        id: ShipmentId,
        target: ShipmentStatus,
    ) -> Result<Shipment> {
        if matches!(
            target,
            ShipmentStatus::EntregaFinalizada | ShipmentStatus::TentativaEntrega
        ) {
            return Err(LogisticsError::InvalidInput(format!(
                "{target} is set by finalizing a delivery or registering an occurrence"
            )));
        }

        let shipment = self.load(id).await?;
        if !session.is_admin() {
            ensure_can_drive(session)?;
            if !driver_may_advance_to(target) {
                return Err(LogisticsError::Forbidden(format!(
                    "drivers cannot set {target}"
                )));
            }
            ensure_assigned(session, shipment.driver_id, id)?;
        }

        let transition = self.plain_transition(session, &shipment, target, DriverChange::Keep)?;
        self.apply(session, &shipment, transition).await
    }

    /// Driver accepts the pickup. Admins dispatch on behalf of `assign_to`.
    #[instrument(skip(self, session), fields(actor = %session.describe()))]
    pub async fn accept_pickup(
        &self,
        session: &SessionContext,
        id: ShipmentId,
        assign_to: Option<DriverId>,
    ) -> Result<Shipment> {
        let driver = resolve_driver(session, assign_to)?;
        let _permit = self.in_flight.acquire(id.0)?;
        let shipment = self.load(id).await?;

        if !can_accept_pickup(shipment.status) {
            self.metrics
                .inc_counter(metric_names::TRANSITIONS_REJECTED)
                .await;
            return Err(LogisticsError::invalid_state(
                "shipment",
                id,
                shipment.status,
                ShipmentStatus::ColetaAceita,
            ));
        }

        let transition = self.plain_transition(
            session,
            &shipment,
            ShipmentStatus::ColetaAceita,
            DriverChange::Assign(driver),
        )?;
        self.apply(session, &shipment, transition).await
    }

    /// Record an occurrence and move the shipment to the status it is bound to
    #[instrument(skip(self, session, input), fields(actor = %session.describe(), kind = %input.kind))]
    pub async fn register_occurrence(
        &self,
        session: &SessionContext,
        id: ShipmentId,
        input: OccurrenceInput,
    ) -> Result<RecordedOccurrence> {
        let target = input.kind.target_status().ok_or_else(|| {
            LogisticsError::InvalidInput(format!("{} cannot be registered directly", input.kind))
        })?;
        let observations = input.trimmed_observations();
        if input.kind.requires_observations() && observations.is_none() {
            return Err(LogisticsError::MissingObservations(
                input.kind.as_str().to_string(),
            ));
        }
        if input.kind.requires_photo() && !input.evidence.has_photos() {
            return Err(LogisticsError::EvidenceRequired(format!(
                "{} on {id} needs at least one photo",
                input.kind
            )));
        }

        let _permit = self.in_flight.acquire(id.0)?;
        let shipment = self.load(id).await?;
        // Pickups and deliveries are closed by the assigned driver; owners
        // may only report failed attempts
        let is_owner = ShipmentOwner::from_session(session) == shipment.owner;
        let driver_id = if input.kind.finalizes() || session.driver_id().is_some() {
            ensure_can_drive(session)?;
            Some(ensure_assigned(session, shipment.driver_id, id)?)
        } else if session.is_admin() || is_owner {
            shipment.driver_id
        } else {
            return Err(LogisticsError::Forbidden(format!(
                "{} cannot register occurrences on {id}",
                session.describe()
            )));
        };
        if !can_transition(shipment.status, target) {
            self.metrics
                .inc_counter(metric_names::TRANSITIONS_REJECTED)
                .await;
            return Err(LogisticsError::invalid_state(
                "shipment",
                id,
                shipment.status,
                target,
            ));
        }

        let uploaded = self.uploader.upload(id.0, &input.evidence).await?;

        let description = input
            .description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| input.kind.default_description().to_string());
        let occurrence = Occurrence {
            id: OccurrenceId::new(),
            subject: Subject::Shipment(id),
            kind: input.kind,
            description: description.clone(),
            observations: observations.clone(),
            resulting_status: StatusValue::Shipment(target),
            photo_url: uploaded.photos.first().map(|p| p.url.clone()),
            signature_url: uploaded.signature_url(),
            driver_id,
            created_at: Utc::now(),
        };
        let transition = ShipmentTransition {
            shipment_id: id,
            expected: shipment.status,
            next: target,
            driver: DriverChange::Keep,
            occurrences: vec![occurrence.clone()],
            history: StatusHistoryEntry::new(
                Subject::Shipment(id),
                StatusValue::Shipment(target),
                session.describe(),
                driver_id,
            )
            .with_description(description)
            .with_observations(observations),
        };

        let updated = self
            .apply_with_evidence(session, &shipment, transition, &uploaded)
            .await?;
        Ok(RecordedOccurrence {
            shipment: updated,
            occurrence,
        })
    }

    /// Close the delivery with at least one photo and an optional signature
    #[instrument(skip(self, session, evidence), fields(actor = %session.describe(), photos = evidence.photos.len()))]
    pub async fn finalize_delivery(
        &self,
        session: &SessionContext,
        id: ShipmentId,
        evidence: EvidenceBundle,
    ) -> Result<Shipment> {
        if !evidence.has_photos() {
            return Err(LogisticsError::EvidenceRequired(format!(
                "delivery of {id} needs at least one photo"
            )));
        }
        ensure_can_drive(session)?;

        let start = Instant::now();
        let _permit = self.in_flight.acquire(id.0)?;
        let shipment = self.load(id).await?;
        if !can_finalize_delivery(shipment.status) {
            self.metrics
                .inc_counter(metric_names::TRANSITIONS_REJECTED)
                .await;
            return Err(LogisticsError::invalid_state(
                "shipment",
                id,
                shipment.status,
                ShipmentStatus::EntregaFinalizada,
            ));
        }
        let driver = ensure_assigned(session, shipment.driver_id, id)?;

        let uploaded = self.uploader.upload(id.0, &evidence).await?;

        let target = ShipmentStatus::EntregaFinalizada;
        let now = Utc::now();
        let occurrences = uploaded
            .photos
            .iter()
            .enumerate()
            .map(|(i, photo)| Occurrence {
                id: OccurrenceId::new(),
                subject: Subject::Shipment(id),
                kind: OccurrenceType::EntregaFinalizada,
                description: OccurrenceType::EntregaFinalizada
                    .default_description()
                    .to_string(),
                observations: None,
                resulting_status: StatusValue::Shipment(target),
                photo_url: Some(photo.url.clone()),
                signature_url: if i == 0 { uploaded.signature_url() } else { None },
                driver_id: Some(driver),
                created_at: now,
            })
            .collect();
        let transition = ShipmentTransition {
            shipment_id: id,
            expected: shipment.status,
            next: target,
            driver: DriverChange::Keep,
            occurrences,
            history: StatusHistoryEntry::new(
                Subject::Shipment(id),
                StatusValue::Shipment(target),
                session.describe(),
                Some(driver),
            ),
        };

        let updated = self
            .apply_with_evidence(session, &shipment, transition, &uploaded)
            .await;
        self.metrics
            .observe_histogram(metric_names::FINALIZE_LATENCY, start.elapsed().as_secs_f64())
            .await;
        updated
    }

    fn plain_transition(
        &self,
        session: &SessionContext,
        shipment: &Shipment,
        target: ShipmentStatus,
        driver: DriverChange,
    ) -> Result<ShipmentTransition> {
        if !can_transition(shipment.status, target) {
            return Err(LogisticsError::invalid_state(
                "shipment",
                shipment.id,
                shipment.status,
                target,
            ));
        }
        Ok(ShipmentTransition {
            shipment_id: shipment.id,
            expected: shipment.status,
            next: target,
            driver,
            occurrences: Vec::new(),
            history: StatusHistoryEntry::new(
                Subject::Shipment(shipment.id),
                StatusValue::Shipment(target),
                session.describe(),
                driver.apply(shipment.driver_id),
            ),
        })
    }

    async fn apply(
        &self,
        session: &SessionContext,
        before: &Shipment,
        transition: ShipmentTransition,
    ) -> Result<Shipment> {
        self.apply_with_evidence(session, before, transition, &UploadedEvidence::default())
            .await
    }

    async fn apply_with_evidence(
        &self,
        session: &SessionContext,
        before: &Shipment,
        transition: ShipmentTransition,
        uploaded: &UploadedEvidence,
    ) -> Result<Shipment> {
        let result = self
            .uploader
            .commit_or_compensate(uploaded, self.repo.apply_shipment_transition(transition))
            .await;
        record_outcome(&self.metrics, &result).await;

        match &result {
            Ok(updated) => {
                info!(
                    shipment_id = %updated.id,
                    from = %before.status,
                    to = %updated.status,
                    actor = %session.describe(),
                    "Shipment transition applied"
                );
                self.notifier
                    .notify(StatusNotification::new(
                        Subject::Shipment(updated.id),
                        updated.tracking_code.as_str(),
                        Some(StatusValue::Shipment(before.status)),
                        StatusValue::Shipment(updated.status),
                        session.describe(),
                    ))
                    .await;
            }
            Err(e) => {
                warn!(shipment_id = %before.id, from = %before.status, error = %e, "Shipment transition failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Package, PackageFormat, PickupOption};
    use crate::infra::{
        InMemoryObjectStorage, InMemoryStore, MockNotifier, MockShipmentRepository, NoopNotifier,
    };
    use crate::workflow::EvidenceFile;
    use uuid::Uuid;

    fn address(name: &str) -> Address {
        Address {
            name: name.to_string(),
            street: "Rua Augusta".to_string(),
            number: "500".to_string(),
            complement: None,
            district: "Consolação".to_string(),
            city: "São Paulo".to_string(),
            state: "SP".to_string(),
            postal_code: "01305-000".to_string(),
            phone: None,
        }
    }

    fn new_shipment() -> NewShipment {
        NewShipment {
            sender: address("Loja A"),
            recipient: address("Cliente B"),
            package: Package {
                weight_grams: 800,
                length_cm: 20,
                width_cm: 15,
                height_cm: 10,
                format: PackageFormat::Box,
            },
            service: "expresso".to_string(),
            pickup: PickupOption::Collect,
            price_cents: 2590,
            document: None,
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        storage: Arc<InMemoryObjectStorage>,
        metrics: Arc<MetricsRegistry>,
        workflow: ShipmentWorkflow,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let storage = Arc::new(InMemoryObjectStorage::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let workflow = ShipmentWorkflow::new(
            store.clone(),
            EvidenceUploader::new(storage.clone(), metrics.clone()),
            Arc::new(NoopNotifier),
            metrics.clone(),
        );
        Fixture {
            store,
            storage,
            metrics,
            workflow,
        }
    }

    fn photo() -> EvidenceFile {
        EvidenceFile::new("door.jpg", "image/jpeg", vec![1, 2, 3])
    }

    async fn in_transit(f: &Fixture, driver: DriverId) -> Shipment {
        let customer = SessionContext::new(Uuid::new_v4(), crate::domain::ActorRole::Customer);
        let admin = SessionContext::admin(Uuid::new_v4());
        let shipment = f.workflow.create_shipment(&customer, new_shipment()).await.unwrap();
        f.workflow
            .accept_pickup(&SessionContext::driver(driver), shipment.id, None)
            .await
            .unwrap();
        for target in [ShipmentStatus::ColetaFinalizada, ShipmentStatus::EmTransito] {
            f.workflow
                .advance_status(&admin, shipment.id, target)
                .await
                .unwrap();
        }
        f.workflow.get_shipment(shipment.id).await.unwrap()
    }

    #[test]
    fn test_table_edges() {
        use ShipmentStatus::*;
        assert!(can_transition(PendingLabel, LabelGenerated));
        assert!(can_transition(TentativaEntrega, EmTransito));
        assert!(can_transition(EnderecoIncorreto, EmTransito));
        assert!(!can_transition(EntregaFinalizada, EmTransito));
        assert!(!can_transition(PendingLabel, EmTransito));
        for status in ShipmentStatus::ALL {
            assert!(!can_transition(EntregaFinalizada, status));
        }
    }

    #[tokio::test]
    async fn test_create_normalizes_and_starts_pending_label() {
        let f = fixture();
        let session = SessionContext::anonymous("sess-1");
        let shipment = f.workflow.create_shipment(&session, new_shipment()).await.unwrap();

        assert_eq!(shipment.status, ShipmentStatus::PendingLabel);
        assert_eq!(shipment.recipient.postal_code, "01305000");
        assert_eq!(shipment.owner, ShipmentOwner::Session("sess-1".to_string()));
        assert!(shipment.tracking_code.as_str().starts_with(TRACKING_PREFIX));
        assert_eq!(f.workflow.history(shipment.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let f = fixture();
        let session = SessionContext::anonymous("s");
        let mut input = new_shipment();
        input.recipient.city = " ".to_string();
        assert!(matches!(
            f.workflow.create_shipment(&session, input).await,
            Err(LogisticsError::InvalidInput(msg)) if msg == "recipient.city"
        ));

        let mut input = new_shipment();
        input.package.weight_grams = 0;
        assert!(f.workflow.create_shipment(&session, input).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_pickup_only_from_label_states() {
        let f = fixture();
        let driver = DriverId::new();
        let admin = SessionContext::admin(Uuid::new_v4());
        let shipment = f
            .workflow
            .create_shipment(&admin, new_shipment())
            .await
            .unwrap();
        for target in [
            ShipmentStatus::LabelGenerated,
            ShipmentStatus::PendingDocument,
        ] {
            f.workflow
                .advance_status(&admin, shipment.id, target)
                .await
                .unwrap();
        }

        let result = f
            .workflow
            .accept_pickup(&SessionContext::driver(driver), shipment.id, None)
            .await;
        assert!(matches!(result, Err(LogisticsError::InvalidState { .. })));
        assert_eq!(
            f.metrics.get_counter(metric_names::TRANSITIONS_REJECTED).await,
            1
        );
    }

    #[tokio::test]
    async fn test_accept_pickup_assigns_driver() {
        let f = fixture();
        let driver = DriverId::new();
        let shipment = f
            .workflow
            .create_shipment(&SessionContext::anonymous("s"), new_shipment())
            .await
            .unwrap();

        let accepted = f
            .workflow
            .accept_pickup(&SessionContext::driver(driver), shipment.id, None)
            .await
            .unwrap();
        assert_eq!(accepted.status, ShipmentStatus::ColetaAceita);
        assert_eq!(accepted.driver_id, Some(driver));

        let history = f.workflow.history(shipment.id).await.unwrap();
        assert_eq!(history.last().unwrap().driver_id, Some(driver));
    }

    #[tokio::test]
    async fn test_finalize_requires_photo_before_anything_else() {
        let f = fixture();
        let result = f
            .workflow
            .finalize_delivery(
                &SessionContext::anonymous("s"),
                ShipmentId::new(),
                EvidenceBundle::default(),
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::EvidenceRequired(_))));
    }

    #[tokio::test]
    async fn test_finalize_by_other_driver_is_forbidden() {
        let f = fixture();
        let shipment = in_transit(&f, DriverId::new()).await;
        let result = f
            .workflow
            .finalize_delivery(
                &SessionContext::driver(DriverId::new()),
                shipment.id,
                EvidenceBundle::default().with_photo(photo()),
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::Forbidden(_))));
        assert!(f.storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_finalize_without_assigned_driver() {
        let f = fixture();
        let admin = SessionContext::admin(Uuid::new_v4());
        let shipment = f.workflow.create_shipment(&admin, new_shipment()).await.unwrap();
        for target in [
            ShipmentStatus::LabelGenerated,
            ShipmentStatus::PendingDocument,
            ShipmentStatus::PendingPayment,
            ShipmentStatus::PaymentConfirmed,
            ShipmentStatus::ColetaAceita,
            ShipmentStatus::ColetaFinalizada,
            ShipmentStatus::EmTransito,
        ] {
            f.workflow
                .advance_status(&admin, shipment.id, target)
                .await
                .unwrap();
        }

        let result = f
            .workflow
            .finalize_delivery(
                &admin,
                shipment.id,
                EvidenceBundle::default().with_photo(photo()),
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::DriverRequired(_))));
    }

    #[tokio::test]
    async fn test_finalize_writes_occurrence_per_photo() {
        let f = fixture();
        let driver = DriverId::new();
        let shipment = in_transit(&f, driver).await;
        let evidence = EvidenceBundle::default()
            .with_photo(photo())
            .with_photo(photo())
            .with_signature(EvidenceFile::new("sig.png", "image/png", vec![7]));

        let done = f
            .workflow
            .finalize_delivery(&SessionContext::driver(driver), shipment.id, evidence)
            .await
            .unwrap();
        assert_eq!(done.status, ShipmentStatus::EntregaFinalizada);

        let occurrences = f.workflow.occurrences(shipment.id).await.unwrap();
        assert_eq!(occurrences.len(), 2);
        assert!(occurrences[0].signature_url.is_some());
        assert!(occurrences[1].signature_url.is_none());
        assert_eq!(f.storage.len().await, 3);
    }

    #[tokio::test]
    async fn test_failed_write_deletes_uploaded_photos() {
        let f = fixture();
        let driver = DriverId::new();
        let shipment = in_transit(&f, driver).await;
        f.store.fail_writes(true);

        let result = f
            .workflow
            .finalize_delivery(
                &SessionContext::driver(driver),
                shipment.id,
                EvidenceBundle::default().with_photo(photo()),
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::Persistence(_))));
        assert!(f.storage.is_empty().await);
        assert_eq!(
            f.metrics
                .get_counter(metric_names::EVIDENCE_COMPENSATED)
                .await,
            1
        );
        f.store.fail_writes(false);
        assert_eq!(
            f.workflow.get_shipment(shipment.id).await.unwrap().status,
            ShipmentStatus::EmTransito
        );
    }

    #[tokio::test]
    async fn test_failed_attempt_then_retry_in_transit() {
        let f = fixture();
        let driver = DriverId::new();
        let session = SessionContext::driver(driver);
        let shipment = in_transit(&f, driver).await;

        let recorded = f
            .workflow
            .register_occurrence(
                &session,
                shipment.id,
                OccurrenceInput::new(OccurrenceType::TentativaEntrega)
                    .with_observations("Destinatário ausente"),
            )
            .await
            .unwrap();
        assert_eq!(recorded.shipment.status, ShipmentStatus::TentativaEntrega);
        assert_eq!(
            recorded.occurrence.observations.as_deref(),
            Some("Destinatário ausente")
        );

        let back = f
            .workflow
            .advance_status(&session, shipment.id, ShipmentStatus::EmTransito)
            .await
            .unwrap();
        assert_eq!(back.status, ShipmentStatus::EmTransito);
    }

    #[tokio::test]
    async fn test_customer_can_only_touch_own_shipment() {
        let f = fixture();
        let owner = SessionContext::anonymous("mine");
        let shipment = f.workflow.create_shipment(&owner, new_shipment()).await.unwrap();

        let result = f
            .workflow
            .register_occurrence(
                &SessionContext::anonymous("other"),
                shipment.id,
                OccurrenceInput::new(OccurrenceType::ColetaRealizada),
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_delivery_occurrence_needs_assigned_driver_and_photo() {
        let f = fixture();
        let owner = SessionContext::anonymous("mine");
        let admin = SessionContext::admin(Uuid::new_v4());
        let shipment = f.workflow.create_shipment(&owner, new_shipment()).await.unwrap();
        for target in [
            ShipmentStatus::LabelGenerated,
            ShipmentStatus::ColetaAceita,
            ShipmentStatus::ColetaFinalizada,
            ShipmentStatus::EmTransito,
        ] {
            f.workflow
                .advance_status(&admin, shipment.id, target)
                .await
                .unwrap();
        }
        let delivered = || {
            OccurrenceInput::new(OccurrenceType::Entregue)
                .with_evidence(EvidenceBundle::default().with_photo(photo()))
        };

        let by_owner = f
            .workflow
            .register_occurrence(&owner, shipment.id, delivered())
            .await;
        assert!(matches!(by_owner, Err(LogisticsError::Forbidden(_))));

        let by_admin = f
            .workflow
            .register_occurrence(&admin, shipment.id, delivered())
            .await;
        assert!(matches!(by_admin, Err(LogisticsError::DriverRequired(_))));

        let by_driver = f
            .workflow
            .register_occurrence(&SessionContext::driver(DriverId::new()), shipment.id, delivered())
            .await;
        assert!(matches!(by_driver, Err(LogisticsError::DriverRequired(_))));

        let stored = f.workflow.get_shipment(shipment.id).await.unwrap();
        assert_eq!(stored.status, ShipmentStatus::EmTransito);
        assert_eq!(stored.driver_id, None);
        assert_eq!(f.store.occurrence_len().await, 0);
        assert!(f.storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_delivery_occurrence_without_photo_rejected() {
        let f = fixture();
        let driver = DriverId::new();
        let shipment = in_transit(&f, driver).await;

        let result = f
            .workflow
            .register_occurrence(
                &SessionContext::driver(driver),
                shipment.id,
                OccurrenceInput::new(OccurrenceType::Entregue),
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::EvidenceRequired(_))));

        let recorded = f
            .workflow
            .register_occurrence(
                &SessionContext::driver(driver),
                shipment.id,
                OccurrenceInput::new(OccurrenceType::Entregue)
                    .with_evidence(EvidenceBundle::default().with_photo(photo())),
            )
            .await
            .unwrap();
        assert_eq!(recorded.shipment.status, ShipmentStatus::EntregaFinalizada);
        assert_eq!(recorded.occurrence.driver_id, Some(driver));
        assert!(recorded.occurrence.photo_url.is_some());
    }

    #[tokio::test]
    async fn test_drivers_report_only_on_their_shipments() {
        let f = fixture();
        let driver = DriverId::new();
        let intruder = SessionContext::driver(DriverId::new());
        let customer = SessionContext::new(Uuid::new_v4(), crate::domain::ActorRole::Customer);
        let shipment = f.workflow.create_shipment(&customer, new_shipment()).await.unwrap();
        f.workflow
            .accept_pickup(&SessionContext::driver(driver), shipment.id, None)
            .await
            .unwrap();

        let collected = f
            .workflow
            .register_occurrence(
                &intruder,
                shipment.id,
                OccurrenceInput::new(OccurrenceType::ColetaRealizada),
            )
            .await;
        assert!(matches!(collected, Err(LogisticsError::Forbidden(_))));

        f.workflow
            .register_occurrence(
                &SessionContext::driver(driver),
                shipment.id,
                OccurrenceInput::new(OccurrenceType::ColetaRealizada),
            )
            .await
            .unwrap();
        f.workflow
            .advance_status(&SessionContext::driver(driver), shipment.id, ShipmentStatus::EmTransito)
            .await
            .unwrap();

        let attempt = || {
            OccurrenceInput::new(OccurrenceType::TentativaEntrega)
                .with_observations("Ninguém em casa")
        };
        let result = f
            .workflow
            .register_occurrence(&intruder, shipment.id, attempt())
            .await;
        assert!(matches!(result, Err(LogisticsError::Forbidden(_))));

        // The owner may still report a failed attempt
        let reported = f
            .workflow
            .register_occurrence(&customer, shipment.id, attempt())
            .await
            .unwrap();
        assert_eq!(reported.shipment.status, ShipmentStatus::TentativaEntrega);
        assert_eq!(reported.occurrence.driver_id, Some(driver));
    }

    #[tokio::test]
    async fn test_unregistrable_type_rejected() {
        let f = fixture();
        let result = f
            .workflow
            .register_occurrence(
                &SessionContext::admin(Uuid::new_v4()),
                ShipmentId::new(),
                OccurrenceInput::new(OccurrenceType::EntregaFinalizada),
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_driver_cannot_advance_to_label_states() {
        let f = fixture();
        let driver = DriverId::new();
        let shipment = f
            .workflow
            .create_shipment(&SessionContext::anonymous("s"), new_shipment())
            .await
            .unwrap();
        let result = f
            .workflow
            .advance_status(
                &SessionContext::driver(driver),
                shipment.id,
                ShipmentStatus::LabelGenerated,
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_conflict_surfaces_as_stale_state() {
        let mut repo = MockShipmentRepository::new();
        let driver = DriverId::new();
        let shipment = Shipment {
            id: ShipmentId::new(),
            tracking_code: TrackingCode::generate(TRACKING_PREFIX),
            status: ShipmentStatus::EmTransito,
            sender: address("A"),
            recipient: address("B"),
            package: new_shipment().package,
            service: "expresso".to_string(),
            pickup: PickupOption::Collect,
            price_cents: 100,
            document: None,
            driver_id: Some(driver),
            owner: ShipmentOwner::User(Uuid::new_v4()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let loaded = shipment.clone();
        repo.expect_get_shipment()
            .returning(move |_| Ok(Some(loaded.clone())));
        repo.expect_apply_shipment_transition().returning(|t| {
            Err(LogisticsError::stale(
                "shipment",
                t.shipment_id,
                t.expected,
                ShipmentStatus::EntregaFinalizada,
            ))
        });

        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let storage = Arc::new(InMemoryObjectStorage::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let workflow = ShipmentWorkflow::new(
            Arc::new(repo),
            EvidenceUploader::new(storage.clone(), metrics.clone()),
            Arc::new(notifier),
            metrics.clone(),
        );

        let result = workflow
            .finalize_delivery(
                &SessionContext::driver(driver),
                shipment.id,
                EvidenceBundle::default().with_photo(photo()),
            )
            .await;
        assert!(matches!(result, Err(LogisticsError::StaleState { .. })));
        assert!(storage.is_empty().await);
        assert_eq!(
            metrics.get_counter(metric_names::TRANSITIONS_CONFLICTS).await,
            1
        );
    }
}
