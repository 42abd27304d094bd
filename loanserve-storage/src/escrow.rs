//! `escrow_accounts` / `escrow_ledger` repository (§3 Escrow account, §4.8
//! escrow waterfall targets).

use sqlx::{PgPool, Postgres, Transaction};
use ulid::Ulid;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowCategory {
    Tax,
    Hazard,
    Flood,
    Mi,
}

impl EscrowCategory {
    pub const ALL: [EscrowCategory; 4] = [
        EscrowCategory::Tax,
        EscrowCategory::Hazard,
        EscrowCategory::Flood,
        EscrowCategory::Mi,
    ];

    fn as_str(self) -> &'static str {
        match self {
            EscrowCategory::Tax => "tax",
            EscrowCategory::Hazard => "hazard",
            EscrowCategory::Flood => "flood",
            EscrowCategory::Mi => "mi",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "tax" => Some(EscrowCategory::Tax),
            "hazard" => Some(EscrowCategory::Hazard),
            "flood" => Some(EscrowCategory::Flood),
            "mi" => Some(EscrowCategory::Mi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EscrowBalance {
    pub balance_cents: i64,
    pub shortage_cents: i64,
}

#[derive(Clone)]
pub struct EscrowRepository {
    pool: PgPool,
}

impl EscrowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn balance(
        &self,
        loan_id: &str,
        category: EscrowCategory,
    ) -> Result<EscrowBalance, StorageError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT balance_cents, shortage_cents FROM escrow_accounts WHERE loan_id = $1 AND category = $2",
        )
        .bind(loan_id)
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((balance_cents, shortage_cents)) => EscrowBalance {
                balance_cents,
                shortage_cents,
            },
            None => EscrowBalance {
                balance_cents: 0,
                shortage_cents: 0,
            },
        })
    }

    /// Sum `balance_cents`/`shortage_cents` across all four escrow
    /// categories (§4.8: "escrow_accounts aggregated across categories").
    pub async fn aggregate_balance(&self, loan_id: &str) -> Result<EscrowBalance, StorageError> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(balance_cents), 0), COALESCE(SUM(shortage_cents), 0) FROM escrow_accounts WHERE loan_id = $1",
        )
        .bind(loan_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(EscrowBalance {
            balance_cents: row.0,
            shortage_cents: row.1,
        })
    }

    pub async fn credit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        loan_id: &str,
        category: EscrowCategory,
        payment_id: &Ulid,
        amount_cents: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO escrow_accounts (loan_id, category, balance_cents, shortage_cents)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (loan_id, category)
            DO UPDATE SET balance_cents = escrow_accounts.balance_cents + $3
            "#,
        )
        .bind(loan_id)
        .bind(category.as_str())
        .bind(amount_cents)
        .execute(tx.as_mut())
        .await?;

        sqlx::query(
            "INSERT INTO escrow_ledger (loan_id, category, payment_id, amount_cents) VALUES ($1, $2, $3, $4)",
        )
        .bind(loan_id)
        .bind(category.as_str())
        .bind(payment_id.to_string())
        .bind(amount_cents)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Mirror every escrow ledger row tied to `payment_id`, decrementing the
    /// balance and incrementing the shortage by the same amount (§4.10 step
    /// 3 "Reverse escrow").
    pub async fn reverse(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        loan_id: &str,
        payment_id: &Ulid,
    ) -> Result<(), StorageError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT category, amount_cents FROM escrow_ledger WHERE loan_id = $1 AND payment_id = $2",
        )
        .bind(loan_id)
        .bind(payment_id.to_string())
        .fetch_all(tx.as_mut())
        .await?;

        for (category, amount_cents) in rows {
            sqlx::query(
                r#"
                UPDATE escrow_accounts
                SET balance_cents = balance_cents - $3,
                    shortage_cents = shortage_cents + $3
                WHERE loan_id = $1 AND category = $2
                "#,
            )
            .bind(loan_id)
            .bind(&category)
            .bind(amount_cents)
            .execute(tx.as_mut())
            .await?;

            sqlx::query(
                "INSERT INTO escrow_ledger (loan_id, category, payment_id, amount_cents) VALUES ($1, $2, $3, $4)",
            )
            .bind(loan_id)
            .bind(&category)
            .bind(payment_id.to_string())
            .bind(-amount_cents)
            .execute(tx.as_mut())
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_has_a_distinct_column_value() {
        let categories = [
            EscrowCategory::Tax,
            EscrowCategory::Hazard,
            EscrowCategory::Flood,
            EscrowCategory::Mi,
        ];
        let names: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
        let mut deduped = names.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }
}
