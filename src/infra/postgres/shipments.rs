use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    Address, DocumentData, DriverId, Occurrence, Package, PickupOption, Shipment, ShipmentId,
    ShipmentOwner, ShipmentStatus, StatusHistoryEntry, TrackingCode,
};
use crate::infra::{LogisticsError, Result, ShipmentRepository, ShipmentTransition};

use super::{
    convert_all, corrupt, driver_binding, insert_history, insert_occurrences, HistoryRow,
    OccurrenceRow, PgStore, HISTORY_COLUMNS, OCCURRENCE_COLUMNS,
};

const SHIPMENT_COLUMNS: &str = "id, tracking_code, status, sender, recipient, package, service, \
     pickup, price_cents, document, driver_id, owner, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct ShipmentRow {
    id: Uuid,
    tracking_code: String,
    status: String,
    sender: Json<Address>,
    recipient: Json<Address>,
    package: Json<Package>,
    service: String,
    pickup: String,
    price_cents: i64,
    document: Option<Json<DocumentData>>,
    driver_id: Option<Uuid>,
    owner: Json<ShipmentOwner>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ShipmentRow> for Shipment {
    type Error = LogisticsError;

    fn try_from(row: ShipmentRow) -> Result<Self> {
        let status = ShipmentStatus::parse(&row.status)
            .ok_or_else(|| corrupt("shipments", row.id, &row.status))?;
        let pickup = PickupOption::parse(&row.pickup)
            .ok_or_else(|| corrupt("shipments", row.id, &row.pickup))?;
        Ok(Shipment {
            id: ShipmentId::from_uuid(row.id),
            tracking_code: TrackingCode(row.tracking_code),
            status,
            sender: row.sender.0,
            recipient: row.recipient.0,
            package: row.package.0,
            service: row.service,
            pickup,
            price_cents: row.price_cents,
            document: row.document.map(|d| d.0),
            driver_id: row.driver_id.map(DriverId::from_uuid),
            owner: row.owner.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl ShipmentRepository for PgStore {
    #[instrument(skip(self, shipment, history), fields(shipment_id = %shipment.id))]
    async fn insert_shipment(
        &self,
        shipment: &Shipment,
        history: &StatusHistoryEntry,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO shipments
                (id, tracking_code, status, sender, recipient, package, service, pickup,
                 price_cents, document, driver_id, owner, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(shipment.id.0)
        .bind(shipment.tracking_code.as_str())
        .bind(shipment.status.as_str())
        .bind(Json(&shipment.sender))
        .bind(Json(&shipment.recipient))
        .bind(Json(&shipment.package))
        .bind(&shipment.service)
        .bind(shipment.pickup.as_str())
        .bind(shipment.price_cents)
        .bind(shipment.document.as_ref().map(Json))
        .bind(shipment.driver_id.map(|d| d.0))
        .bind(Json(&shipment.owner))
        .bind(shipment.created_at)
        .bind(shipment.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>> {
        let sql = format!("SELECT {SHIPMENT_COLUMNS} FROM shipments WHERE id = $1");
        let row: Option<ShipmentRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Shipment::try_from).transpose()
    }

    #[instrument(skip(self, transition), fields(shipment_id = %transition.shipment_id, next = %transition.next))]
    async fn apply_shipment_transition(&self, transition: ShipmentTransition) -> Result<Shipment> {
        let mut tx = self.pool.begin().await?;
        let (set_driver, driver) = driver_binding(transition.driver);

        let sql = format!(
            r#"
            UPDATE shipments
            SET status = $1,
                driver_id = CASE WHEN $2 THEN $3 ELSE driver_id END,
                updated_at = NOW()
            WHERE id = $4 AND status = $5
            RETURNING {SHIPMENT_COLUMNS}
            "#
        );
        let updated: Option<ShipmentRow> = sqlx::query_as(&sql)
            .bind(transition.next.as_str())
            .bind(set_driver)
            .bind(driver)
            .bind(transition.shipment_id.0)
            .bind(transition.expected.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(updated) = updated else {
            let current: Option<(String,)> =
                sqlx::query_as("SELECT status FROM shipments WHERE id = $1")
                    .bind(transition.shipment_id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match current {
                Some((actual,)) => LogisticsError::stale(
                    "shipment",
                    transition.shipment_id,
                    transition.expected,
                    actual,
                ),
                None => LogisticsError::not_found("shipment", transition.shipment_id),
            });
        };

        insert_occurrences(&mut tx, &transition.occurrences).await?;
        insert_history(&mut tx, &transition.history).await?;
        tx.commit().await?;

        Shipment::try_from(updated)
    }

    async fn shipment_history(&self, id: ShipmentId) -> Result<Vec<StatusHistoryEntry>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM status_history h \
             WHERE h.subject_kind = 'shipment' AND h.subject_id = $1 ORDER BY h.seq"
        );
        let rows: Vec<HistoryRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn shipment_occurrences(&self, id: ShipmentId) -> Result<Vec<Occurrence>> {
        let sql = format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrences o \
             WHERE o.subject_kind = 'shipment' AND o.subject_id = $1 ORDER BY o.created_at, o.id"
        );
        let rows: Vec<OccurrenceRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}
