//! `investor_positions` / `payment_distributions` repository.

use chrono::NaiveDate;
use loanserve_core::distribution::{InvestorPosition, InvestorShare};
use sqlx::{PgPool, Postgres, Transaction};
use ulid::Ulid;

use crate::error::StorageError;

#[derive(Clone)]
pub struct DistributionRepository {
    pool: PgPool,
}

impl DistributionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Effective positions as of `as_of`: the latest row per investor whose
    /// `effective_from <= as_of` (§4.9 "positions effective as of the
    /// payment's effective date").
    pub async fn positions_for_loan(
        &self,
        loan_id: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<InvestorPosition>, StorageError> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (investor_id) investor_id, pct_bps
            FROM investor_positions
            WHERE loan_id = $1 AND effective_from <= $2
            ORDER BY investor_id, effective_from DESC
            "#,
        )
        .bind(loan_id)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(investor_id, pct_bps)| InvestorPosition {
                investor_id,
                pct_bps: pct_bps as i64,
            })
            .collect())
    }

    pub async fn record_shares(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: &Ulid,
        effective_date: NaiveDate,
        shares: &[InvestorShare],
    ) -> Result<(), StorageError> {
        for share in shares {
            sqlx::query(
                r#"
                INSERT INTO payment_distributions
                    (payment_id, investor_id, amount_cents, servicing_fee_cents, effective_date, status)
                VALUES ($1, $2, $3, $4, $5, 'posted')
                "#,
            )
            .bind(payment_id.to_string())
            .bind(&share.investor_id)
            .bind(share.amount_cents)
            .bind(share.servicing_fee_cents)
            .bind(effective_date)
            .execute(tx.as_mut())
            .await?;
        }
        Ok(())
    }

    /// Write negative mirror rows for every posted distribution on
    /// `payment_id`, linked by a shared `clawback_id` (§4.9 "on reversal,
    /// write negative mirror rows with status='clawback_pending' linked by a
    /// shared clawback_id").
    pub async fn clawback(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: &Ulid,
        clawback_id: &str,
    ) -> Result<Vec<InvestorShare>, StorageError> {
        let rows: Vec<(String, i64, i64, NaiveDate)> = sqlx::query_as(
            "SELECT investor_id, amount_cents, servicing_fee_cents, effective_date FROM payment_distributions WHERE payment_id = $1 AND status = 'posted'",
        )
        .bind(payment_id.to_string())
        .fetch_all(tx.as_mut())
        .await?;

        let mut shares = Vec::with_capacity(rows.len());
        for (investor_id, amount_cents, servicing_fee_cents, effective_date) in rows {
            sqlx::query(
                r#"
                INSERT INTO payment_distributions
                    (payment_id, investor_id, amount_cents, servicing_fee_cents, effective_date, status, clawback_id)
                VALUES ($1, $2, $3, $4, $5, 'clawback_pending', $6)
                "#,
            )
            .bind(payment_id.to_string())
            .bind(&investor_id)
            .bind(-amount_cents)
            .bind(-servicing_fee_cents)
            .bind(effective_date)
            .bind(clawback_id)
            .execute(tx.as_mut())
            .await?;
            shares.push(InvestorShare {
                investor_id,
                amount_cents: -amount_cents,
                servicing_fee_cents: -servicing_fee_cents,
            });
        }
        Ok(shares)
    }
}
