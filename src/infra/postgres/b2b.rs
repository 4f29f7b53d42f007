use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    Address, B2bShipment, B2bShipmentId, B2bShipmentStatus, B2bShipmentType, B2bVolume, DriverId,
    Occurrence, StatusHistoryEntry, TrackingCode, VolumeId, VolumeStatus,
};
use crate::infra::{B2bRepository, B2bTransition, LogisticsError, Result, VolumeUpdate};

use super::{
    convert_all, corrupt, driver_binding, insert_history, insert_occurrences, HistoryRow,
    OccurrenceRow, PgStore, HISTORY_COLUMNS, OCCURRENCE_COLUMNS,
};

const B2B_COLUMNS: &str = "id, tracking_code, client_id, shipment_type, status, volume_count, \
     total_weight_grams, delivery_date, driver_id, created_at, updated_at";

const VOLUME_COLUMNS: &str =
    "id, shipment_id, sequence, eti_code, weight_grams, status, recipient, updated_at";

fn column_i64(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| LogisticsError::InvalidInput(format!("{column} is out of range")))
}

fn column_i32(value: u64, column: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| LogisticsError::InvalidInput(format!("{column} is out of range")))
}

/// Rows about the shipment itself or any of its volumes
fn b2b_subjects(alias: &str) -> String {
    format!(
        "({alias}.subject_kind = 'b2b_shipment' AND {alias}.subject_id = $1) \
         OR ({alias}.subject_kind = 'b2b_volume' AND {alias}.subject_id IN \
             (SELECT id FROM b2b_volumes WHERE shipment_id = $1))"
    )
}

#[derive(sqlx::FromRow)]
struct B2bShipmentRow {
    id: Uuid,
    tracking_code: String,
    client_id: Uuid,
    shipment_type: Option<String>,
    status: String,
    volume_count: i32,
    total_weight_grams: i64,
    delivery_date: Option<NaiveDate>,
    driver_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<B2bShipmentRow> for B2bShipment {
    type Error = LogisticsError;

    fn try_from(row: B2bShipmentRow) -> Result<Self> {
        let status = B2bShipmentStatus::parse(&row.status)
            .ok_or_else(|| corrupt("b2b_shipments", row.id, &row.status))?;
        Ok(B2bShipment {
            id: B2bShipmentId::from_uuid(row.id),
            tracking_code: TrackingCode(row.tracking_code),
            client_id: row.client_id,
            // Unknown tags fall back to status-based classification
            shipment_type: row.shipment_type.as_deref().and_then(B2bShipmentType::from_tag),
            status,
            volume_count: u32::try_from(row.volume_count)
                .map_err(|_| corrupt("b2b_shipments", row.id, "volume_count"))?,
            total_weight_grams: u64::try_from(row.total_weight_grams)
                .map_err(|_| corrupt("b2b_shipments", row.id, "total_weight_grams"))?,
            delivery_date: row.delivery_date,
            driver_id: row.driver_id.map(DriverId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VolumeRow {
    id: Uuid,
    shipment_id: Uuid,
    sequence: i32,
    eti_code: Option<String>,
    weight_grams: i64,
    status: String,
    recipient: Json<Address>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<VolumeRow> for B2bVolume {
    type Error = LogisticsError;

    fn try_from(row: VolumeRow) -> Result<Self> {
        let status = VolumeStatus::parse(&row.status)
            .ok_or_else(|| corrupt("b2b_volumes", row.id, &row.status))?;
        Ok(B2bVolume {
            id: VolumeId::from_uuid(row.id),
            shipment_id: B2bShipmentId::from_uuid(row.shipment_id),
            sequence: u32::try_from(row.sequence)
                .map_err(|_| corrupt("b2b_volumes", row.id, "sequence"))?,
            eti_code: row.eti_code,
            weight_grams: u64::try_from(row.weight_grams)
                .map_err(|_| corrupt("b2b_volumes", row.id, "weight_grams"))?,
            status,
            recipient: row.recipient.0,
            updated_at: row.updated_at,
        })
    }
}

impl PgStore {
    /// Conditionally move one volume inside an open transaction
    async fn update_volume(
        tx: &mut Transaction<'_, Postgres>,
        update: &VolumeUpdate,
        shipment_id: Option<B2bShipmentId>,
    ) -> Result<VolumeRow> {
        let sql = format!(
            r#"
            UPDATE b2b_volumes
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = $3 AND ($4::uuid IS NULL OR shipment_id = $4)
            RETURNING {VOLUME_COLUMNS}
            "#
        );
        let row: Option<VolumeRow> = sqlx::query_as(&sql)
            .bind(update.next.as_str())
            .bind(update.volume_id.0)
            .bind(update.expected.as_str())
            .bind(shipment_id.map(|id| id.0))
            .fetch_optional(&mut **tx)
            .await?;
        if let Some(row) = row {
            return Ok(row);
        }

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM b2b_volumes WHERE id = $1 AND ($2::uuid IS NULL OR shipment_id = $2)",
        )
        .bind(update.volume_id.0)
        .bind(shipment_id.map(|id| id.0))
        .fetch_optional(&mut **tx)
        .await?;
        Err(match current {
            Some((actual,)) => {
                LogisticsError::stale("b2b_volume", update.volume_id, update.expected, actual)
            }
            None => LogisticsError::not_found("b2b_volume", update.volume_id),
        })
    }
}

#[async_trait]
impl B2bRepository for PgStore {
    #[instrument(skip_all, fields(shipment_id = %shipment.id, volumes = volumes.len()))]
    async fn insert_b2b_shipment(
        &self,
        shipment: &B2bShipment,
        volumes: &[B2bVolume],
        history: &StatusHistoryEntry,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO b2b_shipments
                (id, tracking_code, client_id, shipment_type, status, volume_count,
                 total_weight_grams, delivery_date, driver_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(shipment.id.0)
        .bind(shipment.tracking_code.as_str())
        .bind(shipment.client_id)
        .bind(shipment.shipment_type.map(|t| t.as_str()))
        .bind(shipment.status.as_str())
        .bind(column_i32(shipment.volume_count.into(), "volume_count")?)
        .bind(column_i64(shipment.total_weight_grams, "total_weight_grams")?)
        .bind(shipment.delivery_date)
        .bind(shipment.driver_id.map(|d| d.0))
        .bind(shipment.created_at)
        .bind(shipment.updated_at)
        .execute(&mut *tx)
        .await?;

        for volume in volumes {
            sqlx::query(
                r#"
                INSERT INTO b2b_volumes
                    (id, shipment_id, sequence, eti_code, weight_grams, status, recipient, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(volume.id.0)
            .bind(volume.shipment_id.0)
            .bind(column_i32(volume.sequence.into(), "sequence")?)
            .bind(&volume.eti_code)
            .bind(column_i64(volume.weight_grams, "weight_grams")?)
            .bind(volume.status.as_str())
            .bind(Json(&volume.recipient))
            .bind(volume.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        insert_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_b2b_shipment(&self, id: B2bShipmentId) -> Result<Option<B2bShipment>> {
        let sql = format!("SELECT {B2B_COLUMNS} FROM b2b_shipments WHERE id = $1");
        let row: Option<B2bShipmentRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(B2bShipment::try_from).transpose()
    }

    async fn volumes(&self, id: B2bShipmentId) -> Result<Vec<B2bVolume>> {
        let sql = format!(
            "SELECT {VOLUME_COLUMNS} FROM b2b_volumes WHERE shipment_id = $1 ORDER BY sequence"
        );
        let rows: Vec<VolumeRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn get_volume(&self, id: VolumeId) -> Result<Option<B2bVolume>> {
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM b2b_volumes WHERE id = $1");
        let row: Option<VolumeRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(B2bVolume::try_from).transpose()
    }

    #[instrument(skip(self, transition), fields(shipment_id = %transition.shipment_id, next = %transition.next))]
    async fn apply_b2b_transition(&self, transition: B2bTransition) -> Result<B2bShipment> {
        let mut tx = self.pool.begin().await?;
        let (set_driver, driver) = driver_binding(transition.driver);

        let sql = format!(
            r#"
            UPDATE b2b_shipments
            SET status = $1,
                driver_id = CASE WHEN $2 THEN $3 ELSE driver_id END,
                updated_at = NOW()
            WHERE id = $4 AND status = $5
            RETURNING {B2B_COLUMNS}
            "#
        );
        let updated: Option<B2bShipmentRow> = sqlx::query_as(&sql)
            .bind(transition.next.as_str())
            .bind(set_driver)
            .bind(driver)
            .bind(transition.shipment_id.0)
            .bind(transition.expected.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(updated) = updated else {
            let current: Option<(String,)> =
                sqlx::query_as("SELECT status FROM b2b_shipments WHERE id = $1")
                    .bind(transition.shipment_id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match current {
                Some((actual,)) => LogisticsError::stale(
                    "b2b_shipment",
                    transition.shipment_id,
                    transition.expected,
                    actual,
                ),
                None => LogisticsError::not_found("b2b_shipment", transition.shipment_id),
            });
        };

        // Any failing volume drops the transaction and rolls back the shipment update
        for update in &transition.volumes {
            Self::update_volume(&mut tx, update, Some(transition.shipment_id)).await?;
        }

        insert_occurrences(&mut tx, &transition.occurrences).await?;
        insert_history(&mut tx, &transition.history).await?;
        tx.commit().await?;

        B2bShipment::try_from(updated)
    }

    #[instrument(skip(self, history), fields(volume_id = %update.volume_id, next = %update.next))]
    async fn apply_volume_update(
        &self,
        update: VolumeUpdate,
        history: StatusHistoryEntry,
    ) -> Result<B2bVolume> {
        let mut tx = self.pool.begin().await?;
        let row = Self::update_volume(&mut tx, &update, None).await?;
        insert_history(&mut tx, &history).await?;
        tx.commit().await?;
        B2bVolume::try_from(row)
    }

    async fn b2b_history(&self, id: B2bShipmentId) -> Result<Vec<StatusHistoryEntry>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM status_history h WHERE {} ORDER BY h.seq",
            b2b_subjects("h")
        );
        let rows: Vec<HistoryRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn b2b_occurrences(&self, id: B2bShipmentId) -> Result<Vec<Occurrence>> {
        let sql = format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrences o WHERE {} ORDER BY o.created_at, o.id",
            b2b_subjects("o")
        );
        let rows: Vec<OccurrenceRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_reject_values_that_would_wrap() {
        assert_eq!(column_i64(1_500, "weight_grams").unwrap(), 1_500);
        assert!(matches!(
            column_i64(u64::MAX, "weight_grams"),
            Err(LogisticsError::InvalidInput(_))
        ));
        assert_eq!(column_i32(42, "sequence").unwrap(), 42);
        assert!(column_i32(u64::from(u32::MAX), "sequence").is_err());
    }
}
