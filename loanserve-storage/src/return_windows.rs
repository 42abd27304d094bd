//! `ach_return_windows` repository: tracks how long an ACH credit remains
//! exposed to a return for a given SEC code (§4.11).

use chrono::NaiveDate;
use sqlx::PgPool;
use ulid::Ulid;

use crate::error::StorageError;

#[derive(Clone)]
pub struct ReturnWindowRepository {
    pool: PgPool,
}

impl ReturnWindowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn open(
        &self,
        payment_id: &Ulid,
        sec_code: &str,
        window_days: i32,
        expires_at: NaiveDate,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ach_return_windows (payment_id, sec_code, window_days, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(payment_id.to_string())
        .bind(sec_code)
        .bind(window_days)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `true` while `today <= expires_at`; once the window lapses the
    /// settlement is final and a later return becomes an exception case
    /// instead of a routine reversal (§4.11).
    pub async fn is_open(&self, payment_id: &Ulid, today: NaiveDate) -> Result<bool, StorageError> {
        let row: Option<(NaiveDate,)> =
            sqlx::query_as("SELECT expires_at FROM ach_return_windows WHERE payment_id = $1")
                .bind(payment_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(expires_at,)| today <= expires_at).unwrap_or(false))
    }
}
