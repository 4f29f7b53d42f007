//! Health and metrics handlers
//!
//! - `/health`: liveness, no dependencies touched
//! - `/ready`: storage round trip
//! - `/v1/health/detailed`: storage plus webhook breakers, admin only
//! - `/metrics`, `/metrics/json`: counters and histograms

use std::time::Instant;

use axum::extract::{Extension, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domain::SessionContext;
use crate::infra::ComponentHealth;
use crate::server::AppState;

use super::error::{ApiError, ErrorCode};

const SERVICE_NAME: &str = "courier-flow";

/// Response for the liveness endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

/// Response for the detailed health endpoint
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: HealthStatus,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub storage: ComponentStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub webhook_breakers: Vec<CircuitBreakerStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Operational, but an endpoint breaker is open or storage is slow
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }

    fn http_status(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub response_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakerStatus {
    pub endpoint: String,
    pub state: String,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
}

/// Liveness probe
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Healthy,
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Readiness probe. 503 while storage is unreachable.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let storage = check_storage(&state).await;
    if storage.status.is_unhealthy() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "storage": storage,
            })),
        ));
    }
    Ok(Json(serde_json::json!({
        "status": "ready",
        "storage": storage,
    })))
}

/// Storage and webhook delivery status. Admin sessions only.
pub async fn detailed_health_check(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<(StatusCode, Json<DetailedHealthResponse>), ApiError> {
    if !session.is_admin() {
        return Err(ApiError::new(
            ErrorCode::InsufficientPermissions,
            "admin session required",
        ));
    }

    let storage = check_storage(&state).await;
    let webhook_breakers = match &state.webhook_breakers {
        Some(registry) => breaker_statuses(&registry.status().await),
        None => Vec::new(),
    };
    let status = determine_overall_status(&storage, &webhook_breakers);

    let response = DetailedHealthResponse {
        status,
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.metrics.uptime_seconds(),
        storage,
        webhook_breakers,
    };
    Ok((status.http_status(), Json(response)))
}

/// Prometheus text exposition
pub async fn metrics_prometheus(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
}

pub async fn metrics_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.metrics.to_json().await)
}

async fn check_storage(state: &AppState) -> ComponentStatus {
    let start = Instant::now();
    let health = state.health.check_health().await;
    let response_time_ms = start.elapsed().as_millis() as u64;

    match health {
        ComponentHealth::Healthy => ComponentStatus {
            name: "storage".to_string(),
            status: if response_time_ms < 500 {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            message: None,
            response_time_ms,
        },
        ComponentHealth::Unhealthy(reason) => ComponentStatus {
            name: "storage".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(reason),
            response_time_ms,
        },
    }
}

fn breaker_statuses(status: &serde_json::Value) -> Vec<CircuitBreakerStatus> {
    let Some(obj) = status.as_object() else {
        return Vec::new();
    };
    obj.iter()
        .map(|(endpoint, value)| {
            let stats = value.get("stats").cloned().unwrap_or_default();
            let count = |key: &str| stats.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
            CircuitBreakerStatus {
                endpoint: endpoint.clone(),
                state: value
                    .get("state")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                successes: count("successes"),
                failures: count("failures"),
                rejected: count("rejected"),
            }
        })
        .collect()
}

fn determine_overall_status(
    storage: &ComponentStatus,
    breakers: &[CircuitBreakerStatus],
) -> HealthStatus {
    if storage.status.is_unhealthy() {
        return HealthStatus::Unhealthy;
    }
    if storage.status == HealthStatus::Degraded || breakers.iter().any(|b| b.state == "open") {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}
