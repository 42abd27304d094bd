//! `payment_events` repository backing the hash chain (C4, §4.4).

use loanserve_core::hash_chain::PaymentEvent;
use sqlx::{PgPool, Postgres, Transaction};
use ulid::Ulid;

use crate::error::StorageError;

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: String,
    payment_id: String,
    event_type: String,
    data: serde_json::Value,
    correlation_id: uuid::Uuid,
    prev_event_hash: Option<String>,
    event_hash: String,
    occurred_at: chrono::DateTime<chrono::Utc>,
}

impl EventRow {
    fn into_event(self) -> Result<PaymentEvent, StorageError> {
        Ok(PaymentEvent {
            event_id: Ulid::from_string(&self.event_id)
                .map_err(|e| StorageError::NotFound(e.to_string()))?,
            payment_id: Ulid::from_string(&self.payment_id)
                .map_err(|e| StorageError::NotFound(e.to_string()))?,
            event_type: self.event_type,
            data: self.data,
            correlation_id: self.correlation_id,
            timestamp: self.occurred_at,
            prev_event_hash: self.prev_event_hash,
            event_hash: self.event_hash,
        })
    }
}

#[derive(Clone)]
pub struct EventRepository {
    pool: PgPool,
}

impl EventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent event for `payment_id`, i.e. the tail to pass as
    /// `previous` to `hash_chain::append_event`.
    pub async fn latest(&self, payment_id: &Ulid) -> Result<Option<PaymentEvent>, StorageError> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT * FROM payment_events
            WHERE payment_id = $1
            ORDER BY occurred_at DESC, event_id DESC
            LIMIT 1
            "#,
        )
        .bind(payment_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(EventRow::into_event).transpose()
    }

    /// Inserted in the caller's transaction (§4.4: "All three steps occur in
    /// one local transaction together with fn's writes") so a rollback can
    /// never leave a hash-chain event committed without the idempotency
    /// record and domain writes that belong beside it.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &PaymentEvent,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO payment_events
                (event_id, payment_id, event_type, data, correlation_id, prev_event_hash, event_hash, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.payment_id.to_string())
        .bind(&event.event_type)
        .bind(&event.data)
        .bind(event.correlation_id)
        .bind(&event.prev_event_hash)
        .bind(&event.event_hash)
        .bind(event.timestamp)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Full ordered chain for a payment, for `loanserve-cli chain verify`.
    pub async fn chain_for(&self, payment_id: &Ulid) -> Result<Vec<PaymentEvent>, StorageError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT * FROM payment_events WHERE payment_id = $1 ORDER BY occurred_at, event_id",
        )
        .bind(payment_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> EventRow {
        EventRow {
            event_id: Ulid::new().to_string(),
            payment_id: Ulid::new().to_string(),
            event_type: "payment.ach.received".into(),
            data: serde_json::json!({"amount_cents": 1000}),
            correlation_id: uuid::Uuid::new_v4(),
            prev_event_hash: Some("deadbeef".into()),
            event_hash: "cafebabe".into(),
            occurred_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn row_maps_to_an_event_preserving_every_field() {
        let row = sample_row();
        let expected_hash = row.event_hash.clone();
        let expected_prev = row.prev_event_hash.clone();
        let event = row.into_event().unwrap();
        assert_eq!(event.event_hash, expected_hash);
        assert_eq!(event.prev_event_hash, expected_prev);
        assert_eq!(event.event_type, "payment.ach.received");
    }

    #[test]
    fn genesis_row_has_no_previous_hash() {
        let mut row = sample_row();
        row.prev_event_hash = None;
        let event = row.into_event().unwrap();
        assert!(event.prev_event_hash.is_none());
    }

    #[test]
    fn malformed_payment_id_is_rejected() {
        let mut row = sample_row();
        row.payment_id = "garbage".into();
        assert!(row.into_event().is_err());
    }
}
