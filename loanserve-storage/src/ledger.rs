//! `payment_ledger` repository: persists the postings produced by
//! `loanserve_core::allocation::allocate`.

use chrono::NaiveDate;
use loanserve_core::allocation::LedgerPosting;
use sqlx::{Postgres, Transaction};
use ulid::Ulid;

use crate::error::StorageError;

/// Sum the posted `interest_income` and `principal_receivable` credits for a
/// payment (§4.9 "Inputs: posted ledger for the payment (interest +
/// principal)"); these are the fixed §6.4 accounts `allocate()` credits for
/// the `AccruedInterest`/`ScheduledPrincipal` waterfall targets.
pub async fn target_interest_and_principal(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: &Ulid,
) -> Result<(i64, i64), StorageError> {
    let interest: Option<i64> = sqlx::query_scalar(
        "SELECT COALESCE(SUM(credit_cents), 0) FROM payment_ledger WHERE payment_id = $1 AND account = 'interest_income' AND reversal_of IS NULL",
    )
    .bind(payment_id.to_string())
    .fetch_one(tx.as_mut())
    .await?;
    let principal: Option<i64> = sqlx::query_scalar(
        "SELECT COALESCE(SUM(credit_cents), 0) FROM payment_ledger WHERE payment_id = $1 AND account = 'principal_receivable' AND reversal_of IS NULL",
    )
    .bind(payment_id.to_string())
    .fetch_one(tx.as_mut())
    .await?;
    Ok((interest.unwrap_or(0), principal.unwrap_or(0)))
}

#[derive(Default, Clone, Copy)]
pub struct LedgerRepository;

impl LedgerRepository {
    /// Write one `payment_ledger` row per posting, cash side as the debit
    /// account and the waterfall target as the credit account (§4.8).
    pub async fn record_postings(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        loan_id: &str,
        payment_id: &Ulid,
        effective_date: NaiveDate,
        postings: &[LedgerPosting],
    ) -> Result<(), StorageError> {
        for posting in postings {
            sqlx::query(
                r#"
                INSERT INTO payment_ledger
                    (loan_id, payment_id, account, debit_cents, credit_cents, pending, effective_date)
                VALUES ($1, $2, $3, 0, $4, true, $5)
                "#,
            )
            .bind(loan_id)
            .bind(payment_id.to_string())
            .bind(posting.credit_account)
            .bind(posting.amount_cents)
            .bind(effective_date)
            .execute(tx.as_mut())
            .await?;

            sqlx::query(
                r#"
                INSERT INTO payment_ledger
                    (loan_id, payment_id, account, debit_cents, credit_cents, pending, effective_date)
                VALUES ($1, $2, $3, $4, 0, true, $5)
                "#,
            )
            .bind(loan_id)
            .bind(payment_id.to_string())
            .bind(posting.debit_account)
            .bind(posting.amount_cents)
            .bind(effective_date)
            .execute(tx.as_mut())
            .await?;
        }
        Ok(())
    }

    /// Mark every posting for `payment_id` settled (no longer pending), per
    /// the `processing -> settled` transition.
    pub async fn settle(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: &Ulid,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE payment_ledger SET pending = false WHERE payment_id = $1")
            .bind(payment_id.to_string())
            .execute(tx.as_mut())
            .await?;
        Ok(())
    }

    /// Write reversal rows (negated amounts, linked via `reversal_of`) for
    /// every posting tied to `payment_id` (§4.10 reversal saga). Returns the
    /// `(account, amount_cents)` of each original row reversed, for the
    /// saga's downstream loan-balance-adjustment notification.
    pub async fn reverse(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: &Ulid,
    ) -> Result<Vec<(String, i64)>, StorageError> {
        let rows: Vec<(i64, String, String, i64, i64, NaiveDate)> = sqlx::query_as(
            r#"
            SELECT id, loan_id, account, debit_cents, credit_cents, effective_date
            FROM payment_ledger
            WHERE payment_id = $1 AND reversal_of IS NULL
            "#,
        )
        .bind(payment_id.to_string())
        .fetch_all(tx.as_mut())
        .await?;

        let mut reversed = Vec::with_capacity(rows.len());
        for (id, loan_id, account, debit_cents, credit_cents, effective_date) in rows {
            sqlx::query(
                r#"
                INSERT INTO payment_ledger
                    (loan_id, payment_id, account, debit_cents, credit_cents, pending, effective_date, reversal_of)
                VALUES ($1, $2, $3, $4, $5, false, $6, $7)
                "#,
            )
            .bind(&loan_id)
            .bind(payment_id.to_string())
            .bind(&account)
            .bind(credit_cents)
            .bind(debit_cents)
            .bind(effective_date)
            .bind(id)
            .execute(tx.as_mut())
            .await?;
            reversed.push((account, credit_cents - debit_cents));
        }
        Ok(reversed)
    }
}
