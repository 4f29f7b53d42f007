//! PostgreSQL repositories
//!
//! Every transition runs in one transaction: a conditional
//! `UPDATE ... WHERE status = $expected`, then the occurrence and history
//! inserts. Zero affected rows means another writer got there first.

mod b2b;
mod shipments;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{
    DriverId, Occurrence, OccurrenceId, OccurrenceType, StatusHistoryEntry, StatusValue, Subject,
};

use super::{
    is_retryable_db_error, ComponentHealth, DriverChange, HealthCheck, LogisticsError, Result,
    Retry, RetryConfig,
};

/// Shipment and B2B store backed by PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`, retrying transient failures
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = Retry::new(RetryConfig::database())
            .run_with_predicate(
                "postgres connect",
                || {
                    PgPoolOptions::new()
                        .max_connections(max_connections)
                        .connect(database_url)
                },
                is_retryable_db_error,
            )
            .await
            .into_result()?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl HealthCheck for PgStore {
    async fn check_health(&self) -> ComponentHealth {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => ComponentHealth::Healthy,
            Err(e) => ComponentHealth::Unhealthy(e.to_string()),
        }
    }
}

/// `(overwrite, value)` pair bound into `CASE WHEN $n THEN $m ELSE driver_id END`
fn driver_binding(change: DriverChange) -> (bool, Option<Uuid>) {
    match change {
        DriverChange::Keep => (false, None),
        DriverChange::Assign(driver) => (true, Some(driver.0)),
        DriverChange::Clear => (true, None),
    }
}

fn corrupt(table: &str, id: Uuid, what: &str) -> LogisticsError {
    LogisticsError::Persistence(format!("corrupt {table} row {id}: {what}"))
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    entry: &StatusHistoryEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO status_history
            (id, subject_kind, subject_id, driver_id, actor, status_scope, status,
             description, observations, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(entry.id)
    .bind(entry.subject.kind())
    .bind(entry.subject.id())
    .bind(entry.driver_id.map(|d| d.0))
    .bind(&entry.actor)
    .bind(entry.status.scope())
    .bind(entry.status.as_str())
    .bind(&entry.description)
    .bind(&entry.observations)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_occurrences(
    tx: &mut Transaction<'_, Postgres>,
    occurrences: &[Occurrence],
) -> Result<()> {
    for occurrence in occurrences {
        sqlx::query(
            r#"
            INSERT INTO occurrences
                (id, subject_kind, subject_id, kind, description, observations,
                 status_scope, resulting_status, photo_url, signature_url, driver_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(occurrence.id.0)
        .bind(occurrence.subject.kind())
        .bind(occurrence.subject.id())
        .bind(occurrence.kind.as_str())
        .bind(&occurrence.description)
        .bind(&occurrence.observations)
        .bind(occurrence.resulting_status.scope())
        .bind(occurrence.resulting_status.as_str())
        .bind(&occurrence.photo_url)
        .bind(&occurrence.signature_url)
        .bind(occurrence.driver_id.map(|d| d.0))
        .bind(occurrence.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

const HISTORY_COLUMNS: &str = "h.id, h.subject_kind, h.subject_id, h.driver_id, h.actor, \
     h.status_scope, h.status, h.description, h.observations, h.created_at";

const OCCURRENCE_COLUMNS: &str = "o.id, o.subject_kind, o.subject_id, o.kind, o.description, \
     o.observations, o.status_scope, o.resulting_status, o.photo_url, o.signature_url, \
     o.driver_id, o.created_at";

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    subject_kind: String,
    subject_id: Uuid,
    driver_id: Option<Uuid>,
    actor: String,
    status_scope: String,
    status: String,
    description: String,
    observations: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for StatusHistoryEntry {
    type Error = LogisticsError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        let subject = Subject::from_parts(&row.subject_kind, row.subject_id)
            .ok_or_else(|| corrupt("status_history", row.id, &row.subject_kind))?;
        let status = StatusValue::from_parts(&row.status_scope, &row.status)
            .ok_or_else(|| corrupt("status_history", row.id, &row.status))?;
        Ok(StatusHistoryEntry {
            id: row.id,
            subject,
            driver_id: row.driver_id.map(DriverId::from_uuid),
            actor: row.actor,
            status,
            description: row.description,
            observations: row.observations,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OccurrenceRow {
    id: Uuid,
    subject_kind: String,
    subject_id: Uuid,
    kind: String,
    description: String,
    observations: Option<String>,
    status_scope: String,
    resulting_status: String,
    photo_url: Option<String>,
    signature_url: Option<String>,
    driver_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OccurrenceRow> for Occurrence {
    type Error = LogisticsError;

    fn try_from(row: OccurrenceRow) -> Result<Self> {
        let subject = Subject::from_parts(&row.subject_kind, row.subject_id)
            .ok_or_else(|| corrupt("occurrences", row.id, &row.subject_kind))?;
        let kind = OccurrenceType::parse(&row.kind)
            .ok_or_else(|| corrupt("occurrences", row.id, &row.kind))?;
        let resulting_status = StatusValue::from_parts(&row.status_scope, &row.resulting_status)
            .ok_or_else(|| corrupt("occurrences", row.id, &row.resulting_status))?;
        Ok(Occurrence {
            id: OccurrenceId::from_uuid(row.id),
            subject,
            kind,
            description: row.description,
            observations: row.observations,
            resulting_status,
            photo_url: row.photo_url,
            signature_url: row.signature_url,
            driver_id: row.driver_id.map(DriverId::from_uuid),
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = LogisticsError>,
{
    rows.into_iter().map(T::try_from).collect()
}
