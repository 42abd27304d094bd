//! `payment_transactions` / `payment_state_transitions` repository.

use chrono::{DateTime, NaiveDate, Utc};
use loanserve_core::payment::{Payment, PaymentSource, PaymentState, StateTransition};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use ulid::Ulid;

use crate::error::StorageError;

fn source_str(source: PaymentSource) -> &'static str {
    source.as_str()
}

fn parse_source(raw: &str) -> Result<PaymentSource, StorageError> {
    Ok(match raw {
        "ach" => PaymentSource::Ach,
        "wire" => PaymentSource::Wire,
        "check" => PaymentSource::Check,
        "lockbox" => PaymentSource::Lockbox,
        "card" => PaymentSource::Card,
        "cashier" => PaymentSource::Cashier,
        "money_order" => PaymentSource::MoneyOrder,
        other => return Err(StorageError::NotFound(format!("unknown payment source {other}"))),
    })
}

fn state_str(state: PaymentState) -> &'static str {
    match state {
        PaymentState::Received => "received",
        PaymentState::Validated => "validated",
        PaymentState::Rejected => "rejected",
        PaymentState::PostedPendingSettlement => "posted_pending_settlement",
        PaymentState::Processing => "processing",
        PaymentState::Settled => "settled",
        PaymentState::Returned => "returned",
        PaymentState::Reversed => "reversed",
        PaymentState::Closed => "closed",
    }
}

fn parse_state(raw: &str) -> Result<PaymentState, StorageError> {
    Ok(match raw {
        "received" => PaymentState::Received,
        "validated" => PaymentState::Validated,
        "rejected" => PaymentState::Rejected,
        "posted_pending_settlement" => PaymentState::PostedPendingSettlement,
        "processing" => PaymentState::Processing,
        "settled" => PaymentState::Settled,
        "returned" => PaymentState::Returned,
        "reversed" => PaymentState::Reversed,
        "closed" => PaymentState::Closed,
        other => return Err(StorageError::NotFound(format!("unknown payment state {other}"))),
    })
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    payment_id: String,
    loan_id: String,
    source: String,
    external_ref: String,
    amount_cents: i64,
    currency: String,
    received_at: DateTime<Utc>,
    effective_date: NaiveDate,
    state: String,
    idempotency_key: String,
    metadata: Value,
}

impl PaymentRow {
    fn into_payment(self) -> Result<Payment, StorageError> {
        let metadata: HashMap<String, Value> = serde_json::from_value(self.metadata)?;
        Ok(Payment {
            payment_id: Ulid::from_string(&self.payment_id)
                .map_err(|e| StorageError::NotFound(e.to_string()))?,
            loan_id: self.loan_id,
            source: parse_source(&self.source)?,
            external_ref: self.external_ref,
            amount_cents: self.amount_cents,
            currency: self.currency,
            received_at: self.received_at,
            effective_date: self.effective_date,
            state: parse_state(&self.state)?,
            idempotency_key: self.idempotency_key,
            metadata,
        })
    }
}

#[derive(Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO payment_transactions
                (payment_id, loan_id, source, external_ref, amount_cents, currency,
                 received_at, effective_date, state, idempotency_key, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(payment.payment_id.to_string())
        .bind(&payment.loan_id)
        .bind(source_str(payment.source))
        .bind(&payment.external_ref)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.received_at)
        .bind(payment.effective_date)
        .bind(state_str(payment.state))
        .bind(&payment.idempotency_key)
        .bind(serde_json::to_value(&payment.metadata)?)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    pub async fn find_by_id(&self, payment_id: &Ulid) -> Result<Option<Payment>, StorageError> {
        let row: Option<PaymentRow> =
            sqlx::query_as("SELECT * FROM payment_transactions WHERE payment_id = $1")
                .bind(payment_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentRow::into_payment).transpose()
    }

    /// Duplicate detection for check/lockbox items (§4.6 step 4): any
    /// existing payment with the same `(check_number, payer_account, amount)`
    /// in a non-terminal state.
    pub async fn find_duplicate_check(
        &self,
        check_number: &str,
        payer_account: &str,
        amount_cents: i64,
    ) -> Result<Option<Payment>, StorageError> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT * FROM payment_transactions
            WHERE source = 'check'
              AND amount_cents = $3
              AND metadata->>'check_number' = $1
              AND metadata->>'payer_account' = $2
              AND state NOT IN ('rejected', 'reversed', 'closed')
            LIMIT 1
            "#,
        )
        .bind(check_number)
        .bind(payer_account)
        .bind(amount_cents)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PaymentRow::into_payment).transpose()
    }

    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Payment>, StorageError> {
        let row: Option<PaymentRow> =
            sqlx::query_as("SELECT * FROM payment_transactions WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentRow::into_payment).transpose()
    }

    /// Persist the new state and append the transition row in one
    /// transaction (§3: state change and its audit row are atomic).
    pub async fn apply_transition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        transition: &StateTransition,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE payment_transactions SET state = $2 WHERE payment_id = $1")
            .bind(transition.payment_id.to_string())
            .bind(state_str(transition.new_state))
            .execute(tx.as_mut())
            .await?;

        sqlx::query(
            r#"
            INSERT INTO payment_state_transitions
                (payment_id, previous_state, new_state, occurred_at, actor, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(transition.payment_id.to_string())
        .bind(state_str(transition.previous_state))
        .bind(state_str(transition.new_state))
        .bind(transition.occurred_at)
        .bind(&transition.actor)
        .bind(&transition.reason)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCES: [PaymentSource; 7] = [
        PaymentSource::Ach,
        PaymentSource::Wire,
        PaymentSource::Check,
        PaymentSource::Lockbox,
        PaymentSource::Card,
        PaymentSource::Cashier,
        PaymentSource::MoneyOrder,
    ];

    const STATES: [PaymentState; 9] = [
        PaymentState::Received,
        PaymentState::Validated,
        PaymentState::Rejected,
        PaymentState::PostedPendingSettlement,
        PaymentState::Processing,
        PaymentState::Settled,
        PaymentState::Returned,
        PaymentState::Reversed,
        PaymentState::Closed,
    ];

    #[test]
    fn every_source_round_trips_through_its_string_form() {
        for source in SOURCES {
            assert_eq!(parse_source(source_str(source)).unwrap(), source);
        }
    }

    #[test]
    fn every_state_round_trips_through_its_string_form() {
        for state in STATES {
            assert_eq!(parse_state(state_str(state)).unwrap(), state);
        }
    }

    #[test]
    fn row_with_non_object_metadata_is_rejected() {
        let row = PaymentRow {
            payment_id: Ulid::new().to_string(),
            loan_id: "loan-1".into(),
            source: "ach".into(),
            external_ref: "ref-1".into(),
            amount_cents: 1000,
            currency: "USD".into(),
            received_at: Utc::now(),
            effective_date: chrono::Utc::now().date_naive(),
            state: "received".into(),
            idempotency_key: "idem-1".into(),
            metadata: Value::String("not an object".into()),
        };
        assert!(row.into_payment().is_err());
    }

    #[test]
    fn row_with_empty_metadata_object_maps_cleanly() {
        let row = PaymentRow {
            payment_id: Ulid::new().to_string(),
            loan_id: "loan-1".into(),
            source: "wire".into(),
            external_ref: "ref-2".into(),
            amount_cents: 50_000,
            currency: "USD".into(),
            received_at: Utc::now(),
            effective_date: chrono::Utc::now().date_naive(),
            state: "validated".into(),
            idempotency_key: "idem-2".into(),
            metadata: serde_json::json!({}),
        };
        let payment = row.into_payment().unwrap();
        assert!(payment.metadata.is_empty());
        assert_eq!(payment.source, PaymentSource::Wire);
        assert_eq!(payment.state, PaymentState::Validated);
    }
}
