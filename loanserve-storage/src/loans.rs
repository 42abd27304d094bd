//! Postgres implementation of [`loanserve_core::loan_directory::LoanDirectory`]
//! against the local `loans` projection.

use async_trait::async_trait;
use loanserve_core::loan_directory::{LoanBalances, LoanDirectory, LoanSnapshot};
use loanserve_core::policy::LoanStatus;
use sqlx::PgPool;

use crate::error::StorageError;

fn parse_status(raw: &str) -> Option<LoanStatus> {
    Some(match raw {
        "active" => LoanStatus::Active,
        "current" => LoanStatus::Current,
        "delinquent" => LoanStatus::Delinquent,
        "default" => LoanStatus::Default,
        "charged_off" => LoanStatus::ChargedOff,
        "foreclosure" => LoanStatus::Foreclosure,
        "reo" => LoanStatus::Reo,
        "forbearance" => LoanStatus::Forbearance,
        "modification" => LoanStatus::Modification,
        "application" => LoanStatus::Application,
        "underwriting" => LoanStatus::Underwriting,
        "approved" => LoanStatus::Approved,
        "closed" => LoanStatus::Closed,
        "paid_off" => LoanStatus::PaidOff,
        _ => return None,
    })
}

#[derive(Clone)]
pub struct PgLoanDirectory {
    pool: PgPool,
}

impl PgLoanDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoanDirectory for PgLoanDirectory {
    type Error = StorageError;

    async fn lookup(&self, loan_id: &str) -> Result<Option<LoanSnapshot>, Self::Error> {
        let row: Option<(String, i64, i64, i64, i64, bool)> = sqlx::query_as(
            r#"
            SELECT status, days_past_due, late_fee_balance_cents, accrued_interest_cents,
                   principal_balance_cents, accept_partial_payments
            FROM loans
            WHERE loan_id = $1
            "#,
        )
        .bind(loan_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, days_past_due, late_fee, interest, principal, accept_partial)) = row
        else {
            return Ok(None);
        };

        let Some(status) = parse_status(&status) else {
            return Ok(None);
        };

        Ok(Some(LoanSnapshot {
            status,
            days_past_due,
            balances: LoanBalances {
                late_fee_balance: late_fee,
                accrued_interest: interest,
                principal_balance: principal,
            },
            accept_partial_payments: accept_partial,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_loan_status_parses_from_its_column_value() {
        let statuses = [
            ("active", LoanStatus::Active),
            ("current", LoanStatus::Current),
            ("delinquent", LoanStatus::Delinquent),
            ("default", LoanStatus::Default),
            ("charged_off", LoanStatus::ChargedOff),
            ("foreclosure", LoanStatus::Foreclosure),
            ("reo", LoanStatus::Reo),
            ("forbearance", LoanStatus::Forbearance),
            ("modification", LoanStatus::Modification),
            ("application", LoanStatus::Application),
            ("underwriting", LoanStatus::Underwriting),
            ("approved", LoanStatus::Approved),
            ("closed", LoanStatus::Closed),
            ("paid_off", LoanStatus::PaidOff),
        ];
        for (raw, expected) in statuses {
            assert_eq!(parse_status(raw), Some(expected));
        }
    }

    #[test]
    fn unknown_status_value_parses_to_none_rather_than_erroring() {
        assert_eq!(parse_status("bankrupt"), None);
    }
}
