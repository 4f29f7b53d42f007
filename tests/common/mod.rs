//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use courier_flow::domain::{
    ActorRole, Address, B2bPhase, B2bShipmentId, B2bShipmentType, DriverId, NewB2bShipment,
    NewShipment, NewVolume, Package, PackageFormat, PickupOption, SessionContext, Shipment,
    ShipmentStatus,
};
use courier_flow::infra::{InMemoryObjectStorage, InMemoryStore, NoopNotifier};
use courier_flow::metrics::MetricsRegistry;
use courier_flow::workflow::{
    B2bWorkflow, Completion, EvidenceFile, EvidenceUploader, ShipmentWorkflow, ValidationRegistry,
};

pub const PUBLIC_URL: &str = "https://evidence.test";

pub fn address(name: &str) -> Address {
    Address {
        name: name.to_string(),
        street: "Rua dos Pinheiros".to_string(),
        number: "870".to_string(),
        complement: Some("Galpão 2".to_string()),
        district: "Pinheiros".to_string(),
        city: "São Paulo".to_string(),
        state: "SP".to_string(),
        postal_code: "05422-001".to_string(),
        phone: Some("+55 11 3000-0000".to_string()),
    }
}

pub fn new_shipment() -> NewShipment {
    NewShipment {
        sender: address("Loja Centro"),
        recipient: address("Maria Souza"),
        package: Package {
            weight_grams: 1200,
            length_cm: 30,
            width_cm: 20,
            height_cm: 10,
            format: PackageFormat::Box,
        },
        service: "expresso".to_string(),
        pickup: PickupOption::Collect,
        price_cents: 3190,
        document: None,
    }
}

pub fn b2b_order(
    client_id: Uuid,
    kind: Option<B2bShipmentType>,
    codes: &[Option<&str>],
) -> NewB2bShipment {
    NewB2bShipment {
        client_id,
        shipment_type: kind,
        delivery_date: None,
        volumes: codes
            .iter()
            .map(|code| NewVolume {
                weight_grams: 2500,
                recipient: address("Filial Sul"),
                eti_code: code.map(str::to_string),
            })
            .collect(),
    }
}

pub fn photo(name: &str) -> EvidenceFile {
    EvidenceFile::new(name, "image/jpeg", vec![0xff, 0xd8, 0xff, 0xe0])
}

pub fn admin() -> SessionContext {
    SessionContext::admin(Uuid::new_v4())
}

pub fn customer() -> SessionContext {
    SessionContext::new(Uuid::new_v4(), ActorRole::Customer)
}

pub fn b2b_client() -> SessionContext {
    SessionContext::new(Uuid::new_v4(), ActorRole::B2bClient)
}

/// Both workflows over in-memory adapters
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub storage: Arc<InMemoryObjectStorage>,
    pub metrics: Arc<MetricsRegistry>,
    pub shipments: ShipmentWorkflow,
    pub b2b: B2bWorkflow,
    /// Validation-complete callbacks fired, all legs
    pub completions: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let storage = Arc::new(InMemoryObjectStorage::new(PUBLIC_URL));
        let metrics = Arc::new(MetricsRegistry::new());
        let uploader = EvidenceUploader::new(storage.clone(), metrics.clone());

        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let registry = ValidationRegistry::with_hook(Arc::new(
            move |_: B2bShipmentId, _: B2bPhase, _: &Completion| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let shipments = ShipmentWorkflow::new(
            store.clone(),
            uploader.clone(),
            Arc::new(NoopNotifier),
            metrics.clone(),
        );
        let b2b = B2bWorkflow::with_validations(
            store.clone(),
            uploader,
            Arc::new(NoopNotifier),
            metrics.clone(),
            registry,
        );

        Self {
            store,
            storage,
            metrics,
            shipments,
            b2b,
            completions,
        }
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// A customer shipment picked up by `driver` and moved into transit
    pub async fn shipment_in_transit(&self, driver: DriverId) -> Shipment {
        let shipment = self
            .shipments
            .create_shipment(&customer(), new_shipment())
            .await
            .unwrap();
        self.shipments
            .accept_pickup(&SessionContext::driver(driver), shipment.id, None)
            .await
            .unwrap();
        let admin = admin();
        for target in [ShipmentStatus::ColetaFinalizada, ShipmentStatus::EmTransito] {
            self.shipments
                .advance_status(&admin, shipment.id, target)
                .await
                .unwrap();
        }
        self.shipments.get_shipment(shipment.id).await.unwrap()
    }

    /// A collection order with `codes` accepted by `driver`
    pub async fn accepted_collection(
        &self,
        driver: DriverId,
        codes: &[Option<&str>],
    ) -> B2bShipmentId {
        let client = b2b_client();
        let view = self
            .b2b
            .create_b2b_shipment(
                &client,
                b2b_order(client.actor_id, Some(B2bShipmentType::Collection), codes),
            )
            .await
            .unwrap();
        self.b2b
            .accept_collection(&SessionContext::driver(driver), view.shipment.id, None)
            .await
            .unwrap();
        view.shipment.id
    }
}
