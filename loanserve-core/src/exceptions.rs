//! Exception case model (C12, §3/§4.12).
//!
//! Structured failure record with severity, subcategory, and recommended
//! actions. The state enum mirrors `aerugo-SimCash`'s
//! `models::transaction::TransactionStatus` style of data-bearing variants,
//! generalized to the case lifecycle in §4.12.

pub use crate::returns::Severity;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    AchReturn,
    Nsf,
    WireRecall,
    Duplicate,
    Dispute,
    ReconcileVariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Open,
    Pending,
    Resolved,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionCase {
    pub id: Ulid,
    pub ingestion_id: Option<Ulid>,
    pub payment_id: Option<Ulid>,
    pub category: Category,
    pub subcategory: String,
    pub severity: Severity,
    pub state: CaseState,
    pub assignee: Option<String>,
    pub ai_recommendation: Option<String>,
}

impl ExceptionCase {
    pub fn open(
        category: Category,
        subcategory: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id: Ulid::new(),
            ingestion_id: None,
            payment_id: None,
            category,
            subcategory: subcategory.into(),
            severity,
            state: CaseState::Open,
            assignee: None,
            ai_recommendation: None,
        }
    }

    pub fn with_payment(mut self, payment_id: Ulid) -> Self {
        self.payment_id = Some(payment_id);
        self
    }

    pub fn with_ingestion(mut self, ingestion_id: Ulid) -> Self {
        self.ingestion_id = Some(ingestion_id);
        self
    }

    pub fn assign(&mut self, assignee: impl Into<String>) {
        self.assignee = Some(assignee.into());
        if self.state == CaseState::Open {
            self.state = CaseState::Pending;
        }
    }

    pub fn resolve(&mut self) {
        self.state = CaseState::Resolved;
    }

    pub fn cancel(&mut self) {
        self.state = CaseState::Cancelled;
    }
}

/// NSF (insufficient funds) retry-count severity rule: "NSF retry >2 -> high" (§4.12).
pub fn nsf_severity(retry_count: u32) -> Severity {
    if retry_count > 2 {
        Severity::High
    } else {
        Severity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_case_defaults_to_open_state() {
        let case = ExceptionCase::open(Category::ReconcileVariance, "loan_state_missing", Severity::Medium);
        assert_eq!(case.state, CaseState::Open);
        assert!(case.assignee.is_none());
    }

    #[test]
    fn assigning_moves_open_to_pending() {
        let mut case = ExceptionCase::open(Category::Dispute, "R07", Severity::High);
        case.assign("ops-agent-1");
        assert_eq!(case.state, CaseState::Pending);
        assert_eq!(case.assignee.as_deref(), Some("ops-agent-1"));
    }

    #[test]
    fn resolve_and_cancel_are_terminal() {
        let mut a = ExceptionCase::open(Category::Nsf, "retry-3", Severity::High);
        a.resolve();
        assert_eq!(a.state, CaseState::Resolved);

        let mut b = ExceptionCase::open(Category::Nsf, "retry-1", Severity::Medium);
        b.cancel();
        assert_eq!(b.state, CaseState::Cancelled);
    }

    #[test]
    fn nsf_severity_escalates_after_two_retries() {
        assert_eq!(nsf_severity(1), Severity::Medium);
        assert_eq!(nsf_severity(2), Severity::Medium);
        assert_eq!(nsf_severity(3), Severity::High);
    }
}
