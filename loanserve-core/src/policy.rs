//! Classifier policy table (C7, §4.7).
//!
//! Grounded on `aerugo-SimCash::policy::mod` / `policy::tree::types`: a
//! named policy variant carries a frozen config struct produced by a
//! factory function, rather than being constructed ad hoc at each call
//! site.

use serde::{Deserialize, Serialize};

/// One of the six named policies a loan's payments can be classified under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Current,
    Delinquent,
    Default,
    ChargedOff,
    Suspense,
    Conservative,
}

/// Waterfall target, named the same way §3's `AllocationRule.target` is, so
/// a `PolicyConfig::waterfall` can be turned directly into an ordered
/// [`crate::allocation::AllocationRule`] list by the classifier consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterfallStep {
    LateFees,
    AccruedInterest,
    ScheduledPrincipal,
    Escrow,
    Recovery,
    Suspense,
}

/// Operational flags carried by a policy (§4.7 table's "flags" column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PolicyFlags {
    pub apply_late_fees: bool,
    pub accelerate_payoff: bool,
    pub notify_investors: bool,
    pub escalate_to_legal: bool,
    pub allow_partial_payments: bool,
    pub require_supervisor_approval: bool,
}

/// Frozen configuration for a policy (§4.7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub policy: Policy,
    pub waterfall: Vec<WaterfallStep>,
    pub requires_review: bool,
    pub auto_apply: bool,
    pub max_days_late: Option<u32>,
    pub flags: PolicyFlags,
}

/// Return the frozen config for a given policy, per the §4.7 table.
pub fn config_for(policy: Policy) -> PolicyConfig {
    use WaterfallStep::*;
    match policy {
        Policy::Current => PolicyConfig {
            policy,
            waterfall: vec![AccruedInterest, ScheduledPrincipal, Escrow, LateFees],
            requires_review: false,
            auto_apply: true,
            max_days_late: Some(0),
            flags: PolicyFlags {
                allow_partial_payments: true,
                ..Default::default()
            },
        },
        Policy::Delinquent => PolicyConfig {
            policy,
            waterfall: vec![LateFees, AccruedInterest, ScheduledPrincipal, Escrow],
            requires_review: false,
            auto_apply: true,
            max_days_late: Some(90),
            flags: PolicyFlags {
                apply_late_fees: true,
                notify_investors: true,
                ..Default::default()
            },
        },
        Policy::Default => PolicyConfig {
            policy,
            waterfall: vec![LateFees, AccruedInterest, ScheduledPrincipal],
            requires_review: true,
            auto_apply: false,
            max_days_late: Some(180),
            flags: PolicyFlags {
                accelerate_payoff: true,
                escalate_to_legal: true,
                require_supervisor_approval: true,
                ..Default::default()
            },
        },
        Policy::ChargedOff => PolicyConfig {
            policy,
            waterfall: vec![Recovery],
            requires_review: true,
            auto_apply: false,
            max_days_late: None,
            flags: PolicyFlags {
                accelerate_payoff: true,
                escalate_to_legal: true,
                allow_partial_payments: false,
                ..Default::default()
            },
        },
        Policy::Suspense => PolicyConfig {
            policy,
            waterfall: vec![Suspense],
            requires_review: true,
            auto_apply: false,
            max_days_late: None,
            flags: PolicyFlags {
                require_supervisor_approval: true,
                ..Default::default()
            },
        },
        Policy::Conservative => PolicyConfig {
            policy,
            waterfall: vec![Suspense],
            requires_review: true,
            auto_apply: false,
            max_days_late: None,
            flags: PolicyFlags {
                notify_investors: true,
                require_supervisor_approval: true,
                ..Default::default()
            },
        },
    }
}

/// Loan status as tracked by the servicing system, used by the classifier's
/// status-based branch (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    Current,
    Delinquent,
    Default,
    ChargedOff,
    Foreclosure,
    Reo,
    Forbearance,
    Modification,
    Application,
    Underwriting,
    Approved,
    Closed,
    PaidOff,
}

/// Minimal view of loan state the classifier needs (§4.7, §7 loan state
/// machine is owned by the servicing platform, not this engine — only the
/// fields the classifier reads are modeled here).
#[derive(Debug, Clone, Copy)]
pub struct LoanContext {
    pub status: LoanStatus,
    pub days_past_due: i64,
}

/// Configuration flag resolving the Open Question in §9: which loan
/// statuses have status-precedence over the days-past-due thresholds.
/// Default is `{Forbearance, Modification}`, per the spec's directive.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub status_precedence_for: Vec<LoanStatus>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            status_precedence_for: vec![LoanStatus::Forbearance, LoanStatus::Modification],
        }
    }
}

/// Outcome of classification, carrying the reason an exception case should
/// be opened for when the loan could not be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Policy(Policy),
    MissingLoan,
}

/// Select a policy for a loan per §4.7's ordered rules, honoring the §9
/// Open Question resolution via `config.status_precedence_for`.
pub fn classify(
    loan: Option<LoanContext>,
    config: &ClassifierConfig,
) -> Classification {
    let Some(loan) = loan else {
        return Classification::MissingLoan;
    };

    if config.status_precedence_for.contains(&loan.status) {
        return Classification::Policy(policy_for_status(loan.status));
    }

    if loan.days_past_due > 180 {
        return Classification::Policy(Policy::ChargedOff);
    }
    if loan.days_past_due > 90 {
        return Classification::Policy(Policy::Default);
    }
    if loan.days_past_due > 0 {
        return Classification::Policy(Policy::Delinquent);
    }

    Classification::Policy(policy_for_status(loan.status))
}

fn policy_for_status(status: LoanStatus) -> Policy {
    use LoanStatus::*;
    match status {
        Active | Current => Policy::Current,
        Delinquent => Policy::Delinquent,
        Default => Policy::Default,
        ChargedOff | Foreclosure | Reo => Policy::ChargedOff,
        Forbearance | Modification => Policy::Conservative,
        Application | Underwriting | Approved | Closed | PaidOff => Policy::Suspense,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_loan_yields_missing_loan_classification() {
        assert_eq!(
            classify(None, &ClassifierConfig::default()),
            Classification::MissingLoan
        );
    }

    #[test]
    fn days_past_due_thresholds_take_precedence_for_ordinary_statuses() {
        let config = ClassifierConfig::default();
        let loan = LoanContext {
            status: LoanStatus::Current,
            days_past_due: 200,
        };
        assert_eq!(classify(Some(loan), &config), Classification::Policy(Policy::ChargedOff));

        let loan = LoanContext {
            status: LoanStatus::Current,
            days_past_due: 95,
        };
        assert_eq!(classify(Some(loan), &config), Classification::Policy(Policy::Default));

        let loan = LoanContext {
            status: LoanStatus::Current,
            days_past_due: 5,
        };
        assert_eq!(classify(Some(loan), &config), Classification::Policy(Policy::Delinquent));
    }

    /// §9 Open Question: forbearance with days_past_due > 180 stays
    /// conservative by default (status wins), not charged_off.
    #[test]
    fn forbearance_status_wins_over_days_past_due_by_default() {
        let config = ClassifierConfig::default();
        let loan = LoanContext {
            status: LoanStatus::Forbearance,
            days_past_due: 200,
        };
        assert_eq!(
            classify(Some(loan), &config),
            Classification::Policy(Policy::Conservative)
        );
    }

    #[test]
    fn status_precedence_is_configurable() {
        let config = ClassifierConfig {
            status_precedence_for: vec![],
        };
        let loan = LoanContext {
            status: LoanStatus::Forbearance,
            days_past_due: 200,
        };
        assert_eq!(
            classify(Some(loan), &config),
            Classification::Policy(Policy::ChargedOff)
        );
    }

    #[test]
    fn status_based_classification_for_each_bucket() {
        let config = ClassifierConfig::default();
        for (status, expected) in [
            (LoanStatus::Active, Policy::Current),
            (LoanStatus::Delinquent, Policy::Delinquent),
            (LoanStatus::Default, Policy::Default),
            (LoanStatus::ChargedOff, Policy::ChargedOff),
            (LoanStatus::Application, Policy::Suspense),
        ] {
            let loan = LoanContext {
                status,
                days_past_due: 0,
            };
            assert_eq!(classify(Some(loan), &config), Classification::Policy(expected));
        }
    }
}
