//! `allocation_rules` repository.

use loanserve_core::allocation::{AllocationRule, AllocationTarget};
use sqlx::PgPool;

use crate::error::StorageError;

fn parse_target(raw: &str) -> Result<AllocationTarget, StorageError> {
    Ok(match raw {
        "late_fees" => AllocationTarget::LateFees,
        "accrued_interest" => AllocationTarget::AccruedInterest,
        "scheduled_principal" => AllocationTarget::ScheduledPrincipal,
        "escrow_shortage" => AllocationTarget::EscrowShortage,
        "current_escrow" => AllocationTarget::CurrentEscrow,
        "unapplied_funds" => AllocationTarget::UnappliedFunds,
        other => return Err(StorageError::NotFound(format!("unknown allocation target {other}"))),
    })
}

#[derive(Clone)]
pub struct AllocationRuleRepository {
    pool: PgPool,
}

impl AllocationRuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load every enabled DEFAULT rule plus every rule scoped to `loan_id`;
    /// `loanserve_core::allocation::select_rules` handles the
    /// loan-overrides-DEFAULT merge.
    pub async fn for_loan(&self, loan_id: &str) -> Result<Vec<AllocationRule>, StorageError> {
        let rows: Vec<(Option<String>, i32, String, bool)> = sqlx::query_as(
            r#"
            SELECT loan_id, priority, target, enabled
            FROM allocation_rules
            WHERE loan_id IS NULL OR loan_id = $1
            "#,
        )
        .bind(loan_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(loan_id, priority, target, enabled)| {
                Ok(AllocationRule {
                    loan_id,
                    priority,
                    target: parse_target(&target)?,
                    enabled,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_target_parses_from_its_column_value() {
        let targets = [
            ("late_fees", AllocationTarget::LateFees),
            ("accrued_interest", AllocationTarget::AccruedInterest),
            ("scheduled_principal", AllocationTarget::ScheduledPrincipal),
            ("escrow_shortage", AllocationTarget::EscrowShortage),
            ("current_escrow", AllocationTarget::CurrentEscrow),
            ("unapplied_funds", AllocationTarget::UnappliedFunds),
        ];
        for (raw, expected) in targets {
            assert_eq!(parse_target(raw).unwrap(), expected);
        }
    }

    #[test]
    fn unknown_target_value_is_rejected() {
        assert!(parse_target("overpayment_suspense").is_err());
    }
}
