//! Postgres implementation of [`loanserve_core::idempotency::IdempotencyStore`].

use async_trait::async_trait;
use loanserve_core::idempotency::{IdempotencyRecord, IdempotencyResultState, IdempotencyStore};
use sqlx::{Postgres, Transaction};

use crate::error::StorageError;

#[derive(Default, Clone, Copy)]
pub struct PgIdempotencyStore;

fn state_str(state: IdempotencyResultState) -> &'static str {
    match state {
        IdempotencyResultState::InFlight => "in_flight",
        IdempotencyResultState::Done => "done",
        IdempotencyResultState::Failed => "failed",
    }
}

fn parse_state(raw: &str) -> Option<IdempotencyResultState> {
    match raw {
        "in_flight" => Some(IdempotencyResultState::InFlight),
        "done" => Some(IdempotencyResultState::Done),
        "failed" => Some(IdempotencyResultState::Failed),
        _ => None,
    }
}

async fn set_state(
    tx: &mut Transaction<'_, Postgres>,
    handler_name: &str,
    idempotency_key: &str,
    state: IdempotencyResultState,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE idempotency_records
        SET result_state = $3
        WHERE handler_name = $1 AND idempotency_key = $2
        "#,
    )
    .bind(handler_name)
    .bind(idempotency_key)
    .bind(state_str(state))
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    type Tx = Transaction<'static, Postgres>;
    type Error = StorageError;

    async fn lookup(
        &self,
        tx: &mut Self::Tx,
        handler_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, Self::Error> {
        let row: Option<(String, String, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
            r#"
            SELECT handler_name, result_state, created_at
            FROM idempotency_records
            WHERE handler_name = $1 AND idempotency_key = $2
            "#,
        )
        .bind(handler_name)
        .bind(idempotency_key)
        .fetch_optional(tx.as_mut())
        .await?;

        Ok(row.map(|(handler_name, state, created_at)| IdempotencyRecord {
            handler_name,
            idempotency_key: idempotency_key.to_string(),
            result_state: parse_state(&state).unwrap_or(IdempotencyResultState::Failed),
            created_at,
        }))
    }

    async fn mark_in_flight(
        &self,
        tx: &mut Self::Tx,
        handler_name: &str,
        idempotency_key: &str,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_records (handler_name, idempotency_key, result_state)
            VALUES ($1, $2, 'in_flight')
            "#,
        )
        .bind(handler_name)
        .bind(idempotency_key)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    async fn mark_done(
        &self,
        tx: &mut Self::Tx,
        handler_name: &str,
        idempotency_key: &str,
    ) -> Result<(), Self::Error> {
        set_state(tx, handler_name, idempotency_key, IdempotencyResultState::Done).await
    }

    async fn mark_failed(
        &self,
        tx: &mut Self::Tx,
        handler_name: &str,
        idempotency_key: &str,
    ) -> Result<(), Self::Error> {
        set_state(tx, handler_name, idempotency_key, IdempotencyResultState::Failed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_round_trips_through_its_string_form() {
        for state in [
            IdempotencyResultState::InFlight,
            IdempotencyResultState::Done,
            IdempotencyResultState::Failed,
        ] {
            assert_eq!(parse_state(state_str(state)), Some(state));
        }
    }

    #[test]
    fn unrecognized_state_value_parses_to_none() {
        assert_eq!(parse_state("pending"), None);
    }
}
