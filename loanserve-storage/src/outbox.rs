//! Transactional outbox (§4.3): application code inserts outbox rows in the
//! same transaction as its domain writes; a separate dispatcher drains them
//! with `FOR UPDATE SKIP LOCKED` so multiple worker instances can share the
//! table without double-publishing.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Uuid,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a row within the caller's transaction, so an outbox entry can
    /// never exist without the domain change it announces (and vice versa).
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        msg: &NewOutboxMessage,
    ) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO outbox_messages
                (aggregate_type, aggregate_id, event_type, payload, exchange, routing_key, correlation_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&msg.aggregate_type)
        .bind(&msg.aggregate_id)
        .bind(&msg.event_type)
        .bind(&msg.payload)
        .bind(&msg.exchange)
        .bind(&msg.routing_key)
        .bind(msg.correlation_id)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(row.0)
    }

    /// Open the transaction a dispatcher tick runs [`Self::fetch_batch`] and
    /// every row's [`Self::mark_published`]/[`Self::mark_failed`] in. Keeping
    /// the `FOR UPDATE SKIP LOCKED` select and the row updates in one
    /// uncommitted transaction is what makes the lock actually exclude a
    /// second dispatcher instance from the same batch — committing the
    /// select on its own (as a bare `fetch_all(&pool)` does) releases every
    /// row lock before the batch is published.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, StorageError> {
        Ok(self.pool.begin().await?)
    }

    /// Claim up to `limit` undispatched (or due-for-retry) rows under
    /// `max_attempts`, skipping any already locked by a concurrent
    /// dispatcher instance. Rows that exhausted their attempt budget are
    /// left in place (for audit) but never resurface here. Must run inside
    /// the transaction returned by [`Self::begin`], held open until every
    /// claimed row has been published and marked.
    pub async fn fetch_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxMessage>, StorageError> {
        let rows = sqlx::query_as::<_, OutboxMessage>(
            r#"
            SELECT * FROM outbox_messages
            WHERE published_at IS NULL
              AND attempt_count < $2
              AND (next_retry_at IS NULL OR next_retry_at <= now())
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(tx.as_mut())
        .await?;
        Ok(rows)
    }

    pub async fn mark_published(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE outbox_messages SET published_at = now() WHERE id = $1")
            .bind(id)
            .execute(tx.as_mut())
            .await?;
        Ok(())
    }

    /// Record a failed publish attempt and schedule the next retry.
    /// `next_retry_at` is computed by the caller (`loanserve_broker::backoff`)
    /// so this crate stays free of the retry-policy constants.
    pub async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET attempt_count = attempt_count + 1,
                last_error = $2,
                next_retry_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Record the final failure once `attempt_count` has reached
    /// `max_attempts`, without scheduling another retry — the row simply
    /// falls out of [`Self::fetch_batch`]'s `attempt_count < max_attempts`
    /// filter and stays as a permanent audit trail.
    pub async fn mark_exhausted(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        error: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET attempt_count = attempt_count + 1,
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }
}
