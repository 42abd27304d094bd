//! Late fee assessment and loan-status derivation for the reversal saga's
//! recompute step (C10, §4.10 step 5-6).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// `current | late | delinquent` bucket the reversal saga derives from
/// `next_payment_date` (§4.10 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedLoanStatus {
    Current,
    Late,
    Delinquent,
}

/// Flat late fee assessed once the unpaid due date has exceeded the grace
/// period (§4.10 step 5: "if a scheduled due date remains unpaid > 15 days
/// (grace), assess a configured late fee"). Returns `None` within grace.
pub fn assess_late_fee(
    due_date: NaiveDate,
    today: NaiveDate,
    grace_days: i64,
    flat_fee_cents: i64,
) -> Option<i64> {
    let days_unpaid = (today - due_date).num_days();
    if days_unpaid > grace_days {
        Some(flat_fee_cents)
    } else {
        None
    }
}

/// Derive the `current | late | delinquent` loan-status bucket from how far
/// past due the next scheduled payment is (§4.10 step 6).
pub fn derive_loan_status(next_payment_date: NaiveDate, today: NaiveDate, grace_days: i64) -> DerivedLoanStatus {
    let days_past_due = (today - next_payment_date).num_days();
    if days_past_due <= grace_days {
        DerivedLoanStatus::Current
    } else if days_past_due <= 90 {
        DerivedLoanStatus::Late
    } else {
        DerivedLoanStatus::Delinquent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_fee_within_grace_period() {
        let due = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let today = due + chrono::Duration::days(15);
        assert_eq!(assess_late_fee(due, today, 15, 5_000), None);
    }

    #[test]
    fn fee_assessed_past_grace_period() {
        let due = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let today = due + chrono::Duration::days(16);
        assert_eq!(assess_late_fee(due, today, 15, 5_000), Some(5_000));
    }

    #[test]
    fn status_buckets() {
        let next = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(derive_loan_status(next, next + chrono::Duration::days(10), 15), DerivedLoanStatus::Current);
        assert_eq!(derive_loan_status(next, next + chrono::Duration::days(30), 15), DerivedLoanStatus::Late);
        assert_eq!(derive_loan_status(next, next + chrono::Duration::days(120), 15), DerivedLoanStatus::Delinquent);
    }
}
