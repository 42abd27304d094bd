//! Per-loan mutual exclusion via Postgres advisory locks (§4.8: "acquire
//! `pg_advisory_xact_lock(hashtext(loan_id))` before posting").

use sqlx::{PgConnection, Postgres, Transaction};

use crate::error::StorageError;

/// Acquire a transaction-scoped advisory lock keyed by `loan_id`. Released
/// automatically when `tx` commits or rolls back.
pub async fn lock_loan(
    tx: &mut Transaction<'_, Postgres>,
    loan_id: &str,
) -> Result<(), StorageError> {
    lock_loan_conn(tx.as_mut(), loan_id).await
}

async fn lock_loan_conn(conn: &mut PgConnection, loan_id: &str) -> Result<(), StorageError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(loan_id)
        .execute(conn)
        .await?;
    Ok(())
}
