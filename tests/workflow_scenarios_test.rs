//! End-to-end workflow scenarios over the in-memory adapters.

mod common;

use courier_flow::domain::{
    B2bShipmentStatus, B2bShipmentType, DriverId, OccurrenceType, SessionContext, ShipmentStatus,
    StatusValue, VolumeStatus,
};
use courier_flow::infra::LogisticsError;
use courier_flow::metrics::metric_names;
use courier_flow::workflow::{EvidenceBundle, OccurrenceInput};

use common::*;

// ============================================================================
// Single shipments
// ============================================================================

#[tokio::test]
async fn test_finalize_delivery_with_one_photo() {
    let h = Harness::new();
    let driver = DriverId::new();
    let shipment = h.shipment_in_transit(driver).await;
    assert_eq!(shipment.status, ShipmentStatus::EmTransito);

    let history_before = h.shipments.history(shipment.id).await.unwrap().len();

    let delivered = h
        .shipments
        .finalize_delivery(
            &SessionContext::driver(driver),
            shipment.id,
            EvidenceBundle::default().with_photo(photo("door.jpg")),
        )
        .await
        .unwrap();
    assert_eq!(delivered.status, ShipmentStatus::EntregaFinalizada);

    let history = h.shipments.history(shipment.id).await.unwrap();
    assert_eq!(history.len(), history_before + 1);
    let last = history.last().unwrap();
    assert_eq!(
        last.status,
        StatusValue::Shipment(ShipmentStatus::EntregaFinalizada)
    );
    assert_eq!(last.driver_id, Some(driver));

    let occurrences = h.shipments.occurrences(shipment.id).await.unwrap();
    assert_eq!(occurrences.len(), 1);
    let photo_url = occurrences[0].photo_url.clone().unwrap();
    assert!(photo_url.starts_with(PUBLIC_URL));
    let key = photo_url.trim_start_matches(PUBLIC_URL).trim_start_matches('/');
    assert!(h.storage.get(key).await.is_some());
}

#[tokio::test]
async fn test_accept_pickup_only_from_label_states() {
    let h = Harness::new();
    let driver = DriverId::new();
    let shipment = h.shipment_in_transit(driver).await;

    let result = h
        .shipments
        .accept_pickup(&SessionContext::driver(DriverId::new()), shipment.id, None)
        .await;
    assert!(matches!(result, Err(LogisticsError::InvalidState { .. })));
    assert_eq!(
        h.shipments.get_shipment(shipment.id).await.unwrap().driver_id,
        Some(driver)
    );
}

#[tokio::test]
async fn test_failed_attempt_requires_observations_before_persisting() {
    let h = Harness::new();
    let driver = DriverId::new();
    let shipment = h.shipment_in_transit(driver).await;
    let history_before = h.store.history_len().await;

    let input = OccurrenceInput::new(OccurrenceType::TentativaEntrega)
        .with_observations("   ")
        .with_evidence(EvidenceBundle::default().with_photo(photo("gate.jpg")));
    let result = h
        .shipments
        .register_occurrence(&SessionContext::driver(driver), shipment.id, input)
        .await;

    assert!(matches!(result, Err(LogisticsError::MissingObservations(_))));
    assert_eq!(h.store.history_len().await, history_before);
    assert_eq!(h.store.occurrence_len().await, 0);
    assert!(h.storage.is_empty().await);
    assert_eq!(
        h.shipments.get_shipment(shipment.id).await.unwrap().status,
        ShipmentStatus::EmTransito
    );
}

#[tokio::test]
async fn test_failed_attempt_then_delivery() {
    let h = Harness::new();
    let driver = DriverId::new();
    let session = SessionContext::driver(driver);
    let shipment = h.shipment_in_transit(driver).await;

    let recorded = h
        .shipments
        .register_occurrence(
            &session,
            shipment.id,
            OccurrenceInput::new(OccurrenceType::TentativaEntrega)
                .with_observations("Portão fechado, ninguém atendeu"),
        )
        .await
        .unwrap();
    assert_eq!(recorded.shipment.status, ShipmentStatus::TentativaEntrega);
    assert_eq!(
        recorded.occurrence.observations.as_deref(),
        Some("Portão fechado, ninguém atendeu")
    );

    let delivered = h
        .shipments
        .finalize_delivery(
            &session,
            shipment.id,
            EvidenceBundle::default()
                .with_photo(photo("door.jpg"))
                .with_signature(photo("signature.png")),
        )
        .await
        .unwrap();
    assert_eq!(delivered.status, ShipmentStatus::EntregaFinalizada);

    let occurrences = h.shipments.occurrences(shipment.id).await.unwrap();
    assert_eq!(occurrences.len(), 2);
    assert!(occurrences[1].signature_url.is_some());
}

#[tokio::test]
async fn test_finalize_delivery_compensates_on_failed_write() {
    let h = Harness::new();
    let driver = DriverId::new();
    let shipment = h.shipment_in_transit(driver).await;

    h.store.fail_writes(true);
    let result = h
        .shipments
        .finalize_delivery(
            &SessionContext::driver(driver),
            shipment.id,
            EvidenceBundle::default()
                .with_photo(photo("a.jpg"))
                .with_photo(photo("b.jpg")),
        )
        .await;
    assert!(matches!(result, Err(LogisticsError::Persistence(_))));
    assert!(h.storage.is_empty().await);
    assert_eq!(
        h.metrics
            .get_counter(metric_names::EVIDENCE_COMPENSATED)
            .await,
        2
    );

    h.store.fail_writes(false);
    assert_eq!(
        h.shipments.get_shipment(shipment.id).await.unwrap().status,
        ShipmentStatus::EmTransito
    );
}

// ============================================================================
// B2B collection and delivery
// ============================================================================

#[tokio::test]
async fn test_finalize_before_all_codes_is_incomplete() {
    let h = Harness::new();
    let driver = DriverId::new();
    let session = SessionContext::driver(driver);
    let id = h.accepted_collection(driver, &[None, None, None]).await;

    let codes = h.b2b.required_codes(id).await.unwrap();
    assert_eq!(codes, vec!["ETI-0001", "ETI-0002", "ETI-0003"]);
    for code in &codes[..2] {
        h.b2b.scan_code(&session, id, code, None).await.unwrap();
    }

    let history_before = h.b2b.history(id).await.unwrap().len();
    let result = h
        .b2b
        .finalize_coleta_ou_entrega(&session, id, EvidenceBundle::default())
        .await;
    assert!(matches!(
        result,
        Err(LogisticsError::ValidationIncomplete {
            scanned: 2,
            required: 3
        })
    ));

    let view = h.b2b.view(id).await.unwrap();
    assert_eq!(view.shipment.status, B2bShipmentStatus::Aceita);
    assert_eq!(view.shipment.driver_id, Some(driver));
    assert_eq!(h.b2b.history(id).await.unwrap().len(), history_before);
    assert!(h.b2b.occurrences(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_collection_completes_and_releases_driver() {
    let h = Harness::new();
    let driver = DriverId::new();
    let session = SessionContext::driver(driver);
    let id = h.accepted_collection(driver, &[None, None, None]).await;

    for code in ["ETI-0001", "ETI-0002"] {
        h.b2b.scan_code(&session, id, code, None).await.unwrap();
    }
    assert_eq!(h.completions(), 0);

    let accepted = h.b2b.scan_code(&session, id, "ETI-0003", None).await.unwrap();
    assert!(accepted.complete);
    assert_eq!(accepted.scanned, 3);
    assert_eq!(h.completions(), 1);

    let view = h
        .b2b
        .finalize_coleta_ou_entrega(&session, id, EvidenceBundle::default())
        .await
        .unwrap();
    assert_eq!(view.shipment.status, B2bShipmentStatus::ColetaFinalizada);
    assert_eq!(view.shipment.driver_id, None);
    assert!(view
        .volumes
        .iter()
        .all(|v| v.status == VolumeStatus::Coletado));
    assert_eq!(h.completions(), 1);
}

#[tokio::test]
async fn test_containment_match_is_accepted_once() {
    let h = Harness::new();
    let driver = DriverId::new();
    let session = SessionContext::driver(driver);
    let id = h
        .accepted_collection(driver, &[Some("eti-0001-extra"), Some("ETI-0777")])
        .await;

    let accepted = h.b2b.scan_code(&session, id, "ETI-0001", None).await.unwrap();
    assert_eq!(accepted.matched, "eti-0001-extra");
    assert_eq!(accepted.scanned, 1);

    let again = h.b2b.scan_code(&session, id, "ETI-0001", None).await;
    assert!(matches!(again, Err(LogisticsError::DuplicateCode(_))));
    assert_eq!(h.b2b.validation_status(id).await.unwrap().scanned(), 1);

    let unknown = h.b2b.scan_code(&session, id, "XYZ-9", None).await;
    assert!(matches!(unknown, Err(LogisticsError::UnknownCode(_))));
    assert_eq!(
        h.metrics.get_counter(metric_names::CODES_REJECTED).await,
        2
    );
}

#[tokio::test]
async fn test_delivery_only_order_needs_a_photo() {
    let h = Harness::new();
    let driver = DriverId::new();
    let session = SessionContext::driver(driver);
    let view = h
        .b2b
        .create_b2b_shipment(
            &admin(),
            b2b_order(
                uuid::Uuid::new_v4(),
                Some(B2bShipmentType::Delivery),
                &[None, None],
            ),
        )
        .await
        .unwrap();
    let id = view.shipment.id;

    h.b2b.accept_delivery(&session, id, None).await.unwrap();
    for code in ["ETI-0001", "ETI-0002"] {
        h.b2b.scan_code(&session, id, code, None).await.unwrap();
    }

    let result = h
        .b2b
        .finalize_coleta_ou_entrega(&session, id, EvidenceBundle::default())
        .await;
    assert!(matches!(result, Err(LogisticsError::EvidenceRequired(_))));

    let view = h
        .b2b
        .finalize_coleta_ou_entrega(
            &session,
            id,
            EvidenceBundle::default().with_photo(photo("dock.jpg")),
        )
        .await
        .unwrap();
    assert_eq!(view.shipment.status, B2bShipmentStatus::Entregue);
    assert_eq!(view.display_status, B2bShipmentStatus::Concluido);
    assert_eq!(h.b2b.occurrences(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_full_collection_then_delivery() {
    let h = Harness::new();
    let collector = DriverId::new();
    let courier = DriverId::new();
    let id = h
        .accepted_collection(collector, &[Some("LBL-A"), Some("LBL-B")])
        .await;

    let collector_session = SessionContext::driver(collector);
    for code in ["lbl-a", "LBL-B"] {
        h.b2b
            .scan_code(&collector_session, id, code, None)
            .await
            .unwrap();
    }
    h.b2b
        .finalize_coleta_ou_entrega(&collector_session, id, EvidenceBundle::default())
        .await
        .unwrap();

    // Triage at the hub before dispatch
    let admin = admin();
    let view = h.b2b.view(id).await.unwrap();
    for volume in &view.volumes {
        for target in [
            VolumeStatus::EmTriagem,
            VolumeStatus::AguardandoAceiteExpedicao,
        ] {
            h.b2b.advance_volume(&admin, volume.id, target).await.unwrap();
        }
    }

    let courier_session = SessionContext::driver(courier);
    let view = h.b2b.accept_delivery(&courier_session, id, None).await.unwrap();
    assert_eq!(view.shipment.status, B2bShipmentStatus::EntregaAceita);
    assert!(view.volumes.iter().all(|v| v.status == VolumeStatus::Expedido));

    for code in ["LBL-A", "LBL-B"] {
        h.b2b
            .scan_code(&courier_session, id, code, None)
            .await
            .unwrap();
    }
    let view = h
        .b2b
        .finalize_coleta_ou_entrega(
            &courier_session,
            id,
            EvidenceBundle::default().with_photo(photo("receipt.jpg")),
        )
        .await
        .unwrap();
    assert_eq!(view.display_status, B2bShipmentStatus::Concluido);
    assert_eq!(view.shipment.driver_id, Some(courier));

    // Delivered volumes cannot be sent back; closing them keeps the aggregate
    let first = view.volumes[0].id;
    let result = h
        .b2b
        .advance_volume(&admin, first, VolumeStatus::Devolucao)
        .await;
    assert!(matches!(result, Err(LogisticsError::InvalidState { .. })));

    let closed = h
        .b2b
        .advance_volume(&admin, first, VolumeStatus::Concluido)
        .await
        .unwrap();
    assert_eq!(closed.status, VolumeStatus::Concluido);
    let view = h.b2b.view(id).await.unwrap();
    assert_eq!(view.display_status, B2bShipmentStatus::Concluido);
}

// ============================================================================
// Side paths cannot close a leg
// ============================================================================

#[tokio::test]
async fn test_volume_moves_cannot_skip_collection_scans() {
    let h = Harness::new();
    let driver = DriverId::new();
    let session = SessionContext::driver(driver);
    let id = h.accepted_collection(driver, &[None, None, None]).await;
    let view = h.b2b.view(id).await.unwrap();

    for volume in &view.volumes[..2] {
        let result = h
            .b2b
            .advance_volume(&session, volume.id, VolumeStatus::Coletado)
            .await;
        assert!(matches!(result, Err(LogisticsError::InvalidState { .. })));
    }
    h.b2b.scan_code(&session, id, "ETI-0003", None).await.unwrap();

    let result = h
        .b2b
        .finalize_coleta_ou_entrega(&session, id, EvidenceBundle::default())
        .await;
    assert!(matches!(
        result,
        Err(LogisticsError::ValidationIncomplete { .. })
    ));
    assert_eq!(h.completions(), 0);
    assert_eq!(
        h.b2b.view(id).await.unwrap().shipment.status,
        B2bShipmentStatus::Aceita
    );
}

#[tokio::test]
async fn test_volume_moves_cannot_deliver_without_photo() {
    let h = Harness::new();
    let driver = DriverId::new();
    let session = SessionContext::driver(driver);
    let view = h
        .b2b
        .create_b2b_shipment(
            &admin(),
            b2b_order(b2b_client().actor_id, Some(B2bShipmentType::Delivery), &[None, None]),
        )
        .await
        .unwrap();
    let id = view.shipment.id;
    h.b2b.accept_delivery(&session, id, None).await.unwrap();

    for volume in &view.volumes {
        let result = h
            .b2b
            .advance_volume(&session, volume.id, VolumeStatus::Entregue)
            .await;
        assert!(matches!(result, Err(LogisticsError::InvalidState { .. })));
    }

    let view = h.b2b.view(id).await.unwrap();
    assert_eq!(view.shipment.status, B2bShipmentStatus::EntregaAceita);
    assert_eq!(view.display_status, B2bShipmentStatus::EntregaAceita);
    assert!(view.volumes.iter().all(|v| v.status == VolumeStatus::Expedido));
    assert!(h.b2b.occurrences(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_occurrence_cannot_deliver_unassigned_shipment() {
    let h = Harness::new();
    let owner = customer();
    let shipment = h
        .shipments
        .create_shipment(&owner, new_shipment())
        .await
        .unwrap();
    for target in [
        ShipmentStatus::LabelGenerated,
        ShipmentStatus::ColetaAceita,
        ShipmentStatus::ColetaFinalizada,
        ShipmentStatus::EmTransito,
    ] {
        h.shipments
            .advance_status(&admin(), shipment.id, target)
            .await
            .unwrap();
    }

    let input = OccurrenceInput::new(OccurrenceType::Entregue)
        .with_evidence(EvidenceBundle::default().with_photo(photo("door.jpg")));
    let by_owner = h
        .shipments
        .register_occurrence(&owner, shipment.id, input.clone())
        .await;
    assert!(matches!(by_owner, Err(LogisticsError::Forbidden(_))));

    let by_driver = h
        .shipments
        .register_occurrence(&SessionContext::driver(DriverId::new()), shipment.id, input)
        .await;
    assert!(matches!(by_driver, Err(LogisticsError::DriverRequired(_))));

    let stored = h.shipments.get_shipment(shipment.id).await.unwrap();
    assert_eq!(stored.status, ShipmentStatus::EmTransito);
    assert_eq!(h.store.occurrence_len().await, 0);
    assert!(h.storage.is_empty().await);
}
