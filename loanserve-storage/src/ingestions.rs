//! `payment_ingestions` repository: raw provider payload retained for
//! replay/audit ahead of envelope construction (C5, §4.5).

use serde_json::Value;
use sqlx::PgPool;
use ulid::Ulid;

use crate::error::StorageError;

#[derive(Clone)]
pub struct IngestionRepository {
    pool: PgPool,
}

impl IngestionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        id: &Ulid,
        source: &str,
        provider: Option<&str>,
        raw_payload: &Value,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO payment_ingestions (id, source, provider, raw_payload) VALUES ($1, $2, $3, $4)",
        )
        .bind(id.to_string())
        .bind(source)
        .bind(provider)
        .bind(raw_payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn link_payment(&self, id: &Ulid, payment_id: &Ulid) -> Result<(), StorageError> {
        sqlx::query("UPDATE payment_ingestions SET payment_id = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(payment_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
