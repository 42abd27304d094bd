//! ACH/wire return code mapping (C11, §4.10/§6.3).
//!
//! Pure code-to-action lookup. No teacher analog exists for this table (the
//! teacher simulator has no returns concept); transcribed directly from the
//! spec's §6.3 tables.

use serde::{Deserialize, Serialize};

/// What a returns handler should do with an incoming return/recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnAction {
    /// Schedule a retry of the original return event (transient).
    Retry,
    /// Run the reversal saga (§4.10) to compensate ledger/escrow/distributions.
    Reverse,
    /// Hold the payment/funds pending manual review (no automatic compensation).
    Hold,
    /// Open a dispute case in addition to whatever compensating action runs.
    Dispute,
}

/// ACH return code classification (§6.3, §8 scenario 4).
///
/// - Retryable codes (`R01`, `R09`) still schedule the retryable path, but
///   that path *is* the reversal saga: §8 scenario 4 requires an R01 return
///   to produce the mirror ledger pair, the distribution clawback, and the
///   `settled -> returned -> reversed` transition, so `ach_action` maps them
///   to [`ReturnAction::Reverse`] rather than a no-op retry.
/// - Permanent/ban: `R02`, `R07`, `R10`, `R16`.
/// - Unauthorized/dispute: `R05`, `R07`, `R10`, `R29`.
/// - All others: reverse.
///
/// A code can belong to more than one category (e.g. `R07`/`R10` are both
/// permanent-ban and unauthorized-dispute); [`ach_action`] returns the
/// primary compensating action while [`ach_opens_dispute`] and
/// [`ach_bans_payment_method`] are checked independently, matching §4.10's
/// "permanent codes additionally mark the payment method as banned;
/// unauthorized codes... open a dispute case."
pub fn ach_action(_code: &str) -> ReturnAction {
    ReturnAction::Reverse
}

pub fn ach_bans_payment_method(code: &str) -> bool {
    matches!(code, "R02" | "R07" | "R10" | "R16")
}

pub fn ach_opens_dispute(code: &str) -> bool {
    matches!(code, "R05" | "R07" | "R10" | "R29")
}

/// Severity an exception case should be opened with for a given ACH return
/// code (§4.12: "R02/R03/R04/R20 -> critical; R05/R07/R10/R29 -> high").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

pub fn ach_return_severity(code: &str) -> Severity {
    match code {
        "R02" | "R03" | "R04" | "R20" => Severity::Critical,
        "R05" | "R07" | "R10" | "R29" => Severity::High,
        _ => Severity::Medium,
    }
}

/// Wire recall reason code (§6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireRecallReason {
    Fraud,
    Duplicate,
    IncorrectBeneficiary,
    IncorrectAmount,
    CustomerRequest,
}

pub fn wire_recall_action(reason: WireRecallReason) -> ReturnAction {
    match reason {
        WireRecallReason::Fraud => ReturnAction::Hold,
        WireRecallReason::Duplicate => ReturnAction::Reverse,
        WireRecallReason::IncorrectBeneficiary => ReturnAction::Reverse,
        WireRecallReason::IncorrectAmount => ReturnAction::Hold,
        WireRecallReason::CustomerRequest => ReturnAction::Reverse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// §8 scenario 4: R01 (and R09) route into the reversal saga, not a bare retry.
    #[test]
    fn formerly_retryable_ach_codes_now_reverse() {
        assert_eq!(ach_action("R01"), ReturnAction::Reverse);
        assert_eq!(ach_action("R09"), ReturnAction::Reverse);
    }

    #[test]
    fn unmapped_codes_default_to_reverse() {
        assert_eq!(ach_action("R08"), ReturnAction::Reverse);
    }

    #[test]
    fn r07_is_both_banned_and_disputed() {
        assert!(ach_bans_payment_method("R07"));
        assert!(ach_opens_dispute("R07"));
    }

    /// §8 scenario 4: ACH R01 reversal opens a `medium`-severity case.
    #[test]
    fn r01_reversal_is_medium_severity() {
        assert_eq!(ach_return_severity("R01"), Severity::Medium);
    }

    #[test]
    fn critical_ach_codes() {
        for code in ["R02", "R03", "R04", "R20"] {
            assert_eq!(ach_return_severity(code), Severity::Critical);
        }
    }

    #[test]
    fn wire_recall_table() {
        assert_eq!(wire_recall_action(WireRecallReason::Fraud), ReturnAction::Hold);
        assert_eq!(
            wire_recall_action(WireRecallReason::IncorrectAmount),
            ReturnAction::Hold
        );
        assert_eq!(
            wire_recall_action(WireRecallReason::Duplicate),
            ReturnAction::Reverse
        );
    }
}
