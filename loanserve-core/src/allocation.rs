//! Allocation waterfall (C8, §4.8).
//!
//! Pure allocation math: given a payment amount and an ordered list of
//! enabled rules with their current target balances, produce the ordered
//! ledger debit/credit pairs the posting consumer should write. No I/O, no
//! locking — `loanserve-worker` is responsible for acquiring the per-loan
//! advisory lock and loading target balances before calling in here.
//!
//! Generalizes `aerugo-SimCash`'s `settlement::rtgs::try_settle` (a single
//! atomic debit/credit pair) to an ordered sequence of pairs consuming one
//! shared remaining amount.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One of the allocation targets enumerable in an [`AllocationRule`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationTarget {
    LateFees,
    AccruedInterest,
    ScheduledPrincipal,
    EscrowShortage,
    CurrentEscrow,
    UnappliedFunds,
}

/// Fixed account mapping (§6.4).
impl AllocationTarget {
    pub fn credit_account(&self) -> &'static str {
        match self {
            AllocationTarget::LateFees => "late_fee_income",
            AllocationTarget::AccruedInterest => "interest_income",
            AllocationTarget::ScheduledPrincipal => "principal_receivable",
            // Escrow categories post against the aggregated escrow account;
            // callers supply the concrete sub-account (tax/hazard/flood/mi)
            // via `EscrowCategory` when building rules that touch escrow.
            AllocationTarget::EscrowShortage | AllocationTarget::CurrentEscrow => "escrow_tax",
            AllocationTarget::UnappliedFunds => "unapplied_funds",
        }
    }
}

/// `(loan_id | DEFAULT, priority, target, enabled)` — §3 Allocation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRule {
    pub loan_id: Option<String>,
    pub priority: i32,
    pub target: AllocationTarget,
    pub enabled: bool,
}

/// Target balances loaded from the loan and escrow accounts (§4.8).
#[derive(Debug, Clone, Default)]
pub struct TargetBalances {
    pub late_fee_balance: i64,
    pub accrued_interest: i64,
    pub principal_balance: i64,
    pub escrow_shortage: i64,
    pub current_escrow: i64,
}

impl TargetBalances {
    fn for_target(&self, target: AllocationTarget) -> i64 {
        match target {
            AllocationTarget::LateFees => self.late_fee_balance,
            AllocationTarget::AccruedInterest => self.accrued_interest,
            AllocationTarget::ScheduledPrincipal => self.principal_balance,
            AllocationTarget::EscrowShortage => self.escrow_shortage,
            AllocationTarget::CurrentEscrow => self.current_escrow,
            AllocationTarget::UnappliedFunds => i64::MAX,
        }
    }
}

/// One resulting ledger debit/credit pair (cash debited, target credited).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPosting {
    pub target: AllocationTarget,
    pub debit_account: &'static str,
    pub credit_account: &'static str,
    pub amount_cents: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("amount_cents must be > 0, got {0}")]
    NonPositiveAmount(i64),
}

/// Run the waterfall: for each enabled rule in priority order, take
/// `min(remaining, target_balance)`, append a posting, decrement remaining.
/// Any tail goes to `unapplied_funds` (§4.8). Rules are expected to already
/// be loan-specific-preferred-over-DEFAULT and priority-sorted by the
/// caller (see [`select_rules`]).
///
/// Invariant checked by the caller via [`total_credited`]: the sum of all
/// posting amounts always equals `amount_cents`.
pub fn allocate(
    amount_cents: i64,
    rules: &[AllocationRule],
    balances: &TargetBalances,
) -> Result<Vec<LedgerPosting>, AllocationError> {
    if amount_cents <= 0 {
        return Err(AllocationError::NonPositiveAmount(amount_cents));
    }

    let mut remaining = amount_cents;
    let mut postings = Vec::new();

    for rule in rules.iter().filter(|r| r.enabled) {
        if remaining == 0 {
            break;
        }
        let target_balance = balances.for_target(rule.target);
        let take = remaining.min(target_balance).max(0);
        if take > 0 {
            postings.push(LedgerPosting {
                target: rule.target,
                debit_account: "cash",
                credit_account: rule.target.credit_account(),
                amount_cents: take,
            });
            remaining -= take;
        }
    }

    if remaining > 0 {
        postings.push(LedgerPosting {
            target: AllocationTarget::UnappliedFunds,
            debit_account: "cash",
            credit_account: AllocationTarget::UnappliedFunds.credit_account(),
            amount_cents: remaining,
        });
    }

    Ok(postings)
}

/// Select the effective rule set for a loan: loan-specific rules take
/// precedence over `DEFAULT` rules for the same target (§3 Allocation rule).
pub fn select_rules(loan_id: &str, all_rules: &[AllocationRule]) -> Vec<AllocationRule> {
    let mut by_target: std::collections::BTreeMap<
        (AllocationTarget, i32),
        AllocationRule,
    > = std::collections::BTreeMap::new();

    // DEFAULT rules first, loan-specific rules overwrite them on key clash.
    for rule in all_rules
        .iter()
        .filter(|r| r.loan_id.is_none())
        .chain(all_rules.iter().filter(|r| r.loan_id.as_deref() == Some(loan_id)))
    {
        by_target.insert((rule.target, rule.priority), rule.clone());
    }

    let mut selected: Vec<AllocationRule> = by_target.into_values().collect();
    selected.sort_by_key(|r| r.priority);
    selected
}

/// Restrict a rule set to the escrow-only waterfall (§4.8: "Escrow-only
/// payments skip P&I and walk only `{escrow_shortage, current_escrow}`").
pub fn escrow_only(rules: &[AllocationRule]) -> Vec<AllocationRule> {
    rules
        .iter()
        .filter(|r| {
            matches!(
                r.target,
                AllocationTarget::EscrowShortage | AllocationTarget::CurrentEscrow
            )
        })
        .cloned()
        .collect()
}

pub fn total_credited(postings: &[LedgerPosting]) -> i64 {
    postings.iter().map(|p| p.amount_cents).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(loan_id: Option<&str>, priority: i32, target: AllocationTarget) -> AllocationRule {
        AllocationRule {
            loan_id: loan_id.map(String::from),
            priority,
            target,
            enabled: true,
        }
    }

    /// §8 scenario 1: current-policy allocation.
    #[test]
    fn scenario_current_policy_allocation() {
        let rules = vec![
            rule(None, 0, AllocationTarget::AccruedInterest),
            rule(None, 1, AllocationTarget::ScheduledPrincipal),
            rule(None, 2, AllocationTarget::CurrentEscrow),
            rule(None, 3, AllocationTarget::LateFees),
        ];
        let balances = TargetBalances {
            late_fee_balance: 0,
            accrued_interest: 100_00,
            principal_balance: 200_00,
            escrow_shortage: 0,
            current_escrow: 50_00,
        };
        let postings = allocate(35_000, &rules, &balances).unwrap();
        assert_eq!(
            postings,
            vec![
                LedgerPosting {
                    target: AllocationTarget::AccruedInterest,
                    debit_account: "cash",
                    credit_account: "interest_income",
                    amount_cents: 10_000,
                },
                LedgerPosting {
                    target: AllocationTarget::ScheduledPrincipal,
                    debit_account: "cash",
                    credit_account: "principal_receivable",
                    amount_cents: 20_000,
                },
                LedgerPosting {
                    target: AllocationTarget::CurrentEscrow,
                    debit_account: "cash",
                    credit_account: "escrow_tax",
                    amount_cents: 5_000,
                },
            ]
        );
        assert_eq!(total_credited(&postings), 35_000);
    }

    /// §8 scenario 2: delinquent policy, exact balances consumed, no tail.
    #[test]
    fn scenario_delinquent_policy_no_unapplied_tail() {
        let rules = vec![
            rule(None, 0, AllocationTarget::LateFees),
            rule(None, 1, AllocationTarget::AccruedInterest),
            rule(None, 2, AllocationTarget::ScheduledPrincipal),
        ];
        let balances = TargetBalances {
            late_fee_balance: 1_500,
            accrued_interest: 8_000,
            principal_balance: 12_000,
            escrow_shortage: 0,
            current_escrow: 0,
        };
        let postings = allocate(20_000, &rules, &balances).unwrap();
        assert_eq!(
            postings
                .iter()
                .map(|p| p.amount_cents)
                .collect::<Vec<_>>(),
            vec![1_500, 8_000, 10_500]
        );
        assert!(!postings
            .iter()
            .any(|p| p.target == AllocationTarget::UnappliedFunds));
        assert_eq!(total_credited(&postings), 20_000);
    }

    #[test]
    fn tail_goes_to_unapplied_funds() {
        let rules = vec![rule(None, 0, AllocationTarget::AccruedInterest)];
        let balances = TargetBalances {
            accrued_interest: 1_000,
            ..Default::default()
        };
        let postings = allocate(5_000, &rules, &balances).unwrap();
        let tail = postings.last().unwrap();
        assert_eq!(tail.target, AllocationTarget::UnappliedFunds);
        assert_eq!(tail.amount_cents, 4_000);
        assert_eq!(total_credited(&postings), 5_000);
    }

    #[test]
    fn loan_specific_rule_overrides_default_for_same_target_priority() {
        let rules = vec![
            rule(None, 0, AllocationTarget::LateFees),
            rule(Some("LOAN-1"), 0, AllocationTarget::AccruedInterest),
        ];
        let selected = select_rules("LOAN-1", &rules);
        assert_eq!(selected.len(), 2);
        assert!(selected
            .iter()
            .any(|r| r.target == AllocationTarget::AccruedInterest && r.loan_id.is_some()));
    }

    #[test]
    fn escrow_only_excludes_principal_and_interest() {
        let rules = vec![
            rule(None, 0, AllocationTarget::AccruedInterest),
            rule(None, 1, AllocationTarget::ScheduledPrincipal),
            rule(None, 2, AllocationTarget::EscrowShortage),
            rule(None, 3, AllocationTarget::CurrentEscrow),
        ];
        let only = escrow_only(&rules);
        assert_eq!(only.len(), 2);
        assert!(only.iter().all(|r| matches!(
            r.target,
            AllocationTarget::EscrowShortage | AllocationTarget::CurrentEscrow
        )));
    }

    #[test]
    fn rejects_non_positive_amount() {
        assert_eq!(
            allocate(0, &[], &TargetBalances::default()).unwrap_err(),
            AllocationError::NonPositiveAmount(0)
        );
    }
}
