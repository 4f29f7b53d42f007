//! REST API endpoints for courier-flow.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    B2bShipmentId, B2bShipmentView, B2bVolume, NewB2bShipment, NewShipment, Occurrence,
    OccurrenceType, SessionContext, Shipment, ShipmentId, ShipmentStatus, StatusHistoryEntry,
    VolumeId, VolumeStatus,
};
use crate::server::AppState;
use crate::workflow::{OccurrenceInput, RecordedOccurrence, ScanAccepted, ValidationStatus};

use super::error::{validation_error, ApiError};
use super::types::{AcceptRequest, EvidenceBody, OccurrenceRequest, ScanRequest, StatusRequest};

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the `/v1` router. Every route expects a [`SessionContext`] extension.
pub fn router() -> Router<AppState> {
    Router::new()
        // Single shipments
        .route("/v1/shipments", post(create_shipment))
        .route("/v1/shipments/:id", get(get_shipment))
        .route("/v1/shipments/:id/history", get(shipment_history))
        .route(
            "/v1/shipments/:id/occurrences",
            get(shipment_occurrences).post(register_occurrence),
        )
        .route("/v1/shipments/:id/status", post(advance_status))
        .route("/v1/shipments/:id/accept", post(accept_pickup))
        .route("/v1/shipments/:id/finalize", post(finalize_delivery))
        // B2B orders
        .route("/v1/b2b/shipments", post(create_b2b_shipment))
        .route("/v1/b2b/shipments/:id", get(get_b2b_shipment))
        .route("/v1/b2b/shipments/:id/history", get(b2b_history))
        .route("/v1/b2b/shipments/:id/occurrences", get(b2b_occurrences))
        .route(
            "/v1/b2b/shipments/:id/accept-collection",
            post(accept_collection),
        )
        .route("/v1/b2b/shipments/:id/accept-delivery", post(accept_delivery))
        .route("/v1/b2b/shipments/:id/codes", get(required_codes))
        .route("/v1/b2b/shipments/:id/scan", post(scan_code))
        .route("/v1/b2b/shipments/:id/validation", get(validation_status))
        .route("/v1/b2b/shipments/:id/finalize", post(finalize_b2b))
        .route("/v1/b2b/volumes/:id/status", post(advance_volume))
}

fn parse_status<T>(
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ApiError> {
    let normalized = raw.trim().to_ascii_uppercase();
    parse(&normalized).ok_or_else(|| validation_error("status", format!("unknown status {raw}")))
}

// ============================================================================
// Single shipments
// ============================================================================

async fn create_shipment(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    body: Result<Json<NewShipment>, JsonRejection>,
) -> Result<(StatusCode, Json<Shipment>), ApiError> {
    let Json(input) = body?;
    let shipment = state.shipments.create_shipment(&session, input).await?;
    Ok((StatusCode::CREATED, Json(shipment)))
}

async fn get_shipment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Shipment> {
    Ok(Json(state.shipments.get_shipment(ShipmentId(id)).await?))
}

async fn shipment_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<StatusHistoryEntry>> {
    Ok(Json(state.shipments.history(ShipmentId(id)).await?))
}

async fn shipment_occurrences(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Occurrence>> {
    Ok(Json(state.shipments.occurrences(ShipmentId(id)).await?))
}

async fn advance_status(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult<Shipment> {
    let Json(body) = body?;
    let target = parse_status(&body.status, ShipmentStatus::parse)?;
    let shipment = state
        .shipments
        .advance_status(&session, ShipmentId(id), target)
        .await?;
    Ok(Json(shipment))
}

async fn accept_pickup(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<AcceptRequest>>,
) -> ApiResult<Shipment> {
    let assign_to = body.and_then(|Json(b)| b.assign_to());
    let shipment = state
        .shipments
        .accept_pickup(&session, ShipmentId(id), assign_to)
        .await?;
    Ok(Json(shipment))
}

#[derive(Debug, Serialize)]
struct OccurrenceResponse {
    shipment: Shipment,
    occurrence: Occurrence,
}

impl From<RecordedOccurrence> for OccurrenceResponse {
    fn from(recorded: RecordedOccurrence) -> Self {
        Self {
            shipment: recorded.shipment,
            occurrence: recorded.occurrence,
        }
    }
}

async fn register_occurrence(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Result<Json<OccurrenceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OccurrenceResponse>), ApiError> {
    let Json(body) = body?;
    let kind = OccurrenceType::parse(body.kind.trim())
        .ok_or_else(|| validation_error("type", format!("unknown occurrence type {}", body.kind)))?;
    let input = OccurrenceInput {
        kind,
        description: body.description,
        observations: body.observations,
        evidence: body.evidence.into_bundle()?,
    };
    let recorded = state
        .shipments
        .register_occurrence(&session, ShipmentId(id), input)
        .await?;
    Ok((StatusCode::CREATED, Json(recorded.into())))
}

async fn finalize_delivery(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Result<Json<EvidenceBody>, JsonRejection>,
) -> ApiResult<Shipment> {
    let Json(body) = body?;
    let shipment = state
        .shipments
        .finalize_delivery(&session, ShipmentId(id), body.into_bundle()?)
        .await?;
    Ok(Json(shipment))
}

// ============================================================================
// B2B orders
// ============================================================================

async fn create_b2b_shipment(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    body: Result<Json<NewB2bShipment>, JsonRejection>,
) -> Result<(StatusCode, Json<B2bShipmentView>), ApiError> {
    let Json(input) = body?;
    let view = state.b2b.create_b2b_shipment(&session, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_b2b_shipment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<B2bShipmentView> {
    Ok(Json(state.b2b.view(B2bShipmentId(id)).await?))
}

async fn b2b_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<StatusHistoryEntry>> {
    Ok(Json(state.b2b.history(B2bShipmentId(id)).await?))
}

async fn b2b_occurrences(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Occurrence>> {
    Ok(Json(state.b2b.occurrences(B2bShipmentId(id)).await?))
}

async fn accept_collection(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<AcceptRequest>>,
) -> ApiResult<B2bShipmentView> {
    let assign_to = body.and_then(|Json(b)| b.assign_to());
    let view = state
        .b2b
        .accept_collection(&session, B2bShipmentId(id), assign_to)
        .await?;
    Ok(Json(view))
}

async fn accept_delivery(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<AcceptRequest>>,
) -> ApiResult<B2bShipmentView> {
    let assign_to = body.and_then(|Json(b)| b.assign_to());
    let view = state
        .b2b
        .accept_delivery(&session, B2bShipmentId(id), assign_to)
        .await?;
    Ok(Json(view))
}

async fn required_codes(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let codes = state.b2b.required_codes(B2bShipmentId(id)).await?;
    Ok(Json(serde_json::json!({
        "codes": codes,
        "count": codes.len(),
    })))
}

async fn scan_code(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Result<Json<ScanRequest>, JsonRejection>,
) -> ApiResult<ScanAccepted> {
    let Json(body) = body?;
    let photo = body
        .photo
        .as_ref()
        .map(|p| p.decode("photo"))
        .transpose()?;
    let accepted = state
        .b2b
        .scan_code(&session, B2bShipmentId(id), &body.code, photo)
        .await?;
    Ok(Json(accepted))
}

async fn validation_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ValidationStatus> {
    Ok(Json(state.b2b.validation_status(B2bShipmentId(id)).await?))
}

async fn finalize_b2b(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<EvidenceBody>>,
) -> ApiResult<B2bShipmentView> {
    let evidence = match body {
        Some(Json(body)) => body.into_bundle()?,
        None => Default::default(),
    };
    let view = state
        .b2b
        .finalize_coleta_ou_entrega(&session, B2bShipmentId(id), evidence)
        .await?;
    Ok(Json(view))
}

async fn advance_volume(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<Uuid>,
    body: Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult<B2bVolume> {
    let Json(body) = body?;
    let target = parse_status(&body.status, VolumeStatus::parse)?;
    let volume = state
        .b2b
        .advance_volume(&session, VolumeId(id), target)
        .await?;
    Ok(Json(volume))
}
