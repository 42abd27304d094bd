//! Payment aggregate and state machine (§3 Payment).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use ulid::Ulid;

/// Inbound channel a payment arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSource {
    Ach,
    Wire,
    Check,
    Lockbox,
    Card,
    Cashier,
    MoneyOrder,
}

impl PaymentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentSource::Ach => "ach",
            PaymentSource::Wire => "wire",
            PaymentSource::Check => "check",
            PaymentSource::Lockbox => "lockbox",
            PaymentSource::Card => "card",
            PaymentSource::Cashier => "cashier",
            PaymentSource::MoneyOrder => "money_order",
        }
    }
}

/// Payment lifecycle state.
///
/// Initial state is `Received`; terminal states are `Settled`, `Rejected`,
/// `Reversed`, and `Closed`. Transitions allowed by §3:
///
/// ```text
/// received -> validated -> posted_pending_settlement -> processing -> settled
/// received -> rejected
/// settled -> returned -> reversed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Received,
    Validated,
    Rejected,
    PostedPendingSettlement,
    Processing,
    Settled,
    Returned,
    Reversed,
    Closed,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Settled
                | PaymentState::Rejected
                | PaymentState::Reversed
                | PaymentState::Closed
        )
    }

    /// True if `self -> next` is one of the edges enumerated in §3.
    pub fn can_transition_to(&self, next: PaymentState) -> bool {
        use PaymentState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Rejected)
                | (Validated, PostedPendingSettlement)
                | (PostedPendingSettlement, Processing)
                | (Processing, Settled)
                | (Settled, Returned)
                | (Returned, Reversed)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: PaymentState,
        to: PaymentState,
    },
    #[error("amount_cents must be >= 0, got {0}")]
    NegativeAmount(i64),
}

/// A single row in `payment_state_transitions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub payment_id: Ulid,
    pub previous_state: PaymentState,
    pub new_state: PaymentState,
    pub occurred_at: DateTime<Utc>,
    pub actor: String,
    pub reason: Option<String>,
}

/// The `payment_transactions` aggregate (§3 Payment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Ulid,
    pub loan_id: String,
    pub source: PaymentSource,
    pub external_ref: String,
    pub amount_cents: i64,
    pub currency: String,
    pub received_at: DateTime<Utc>,
    pub effective_date: NaiveDate,
    pub state: PaymentState,
    pub idempotency_key: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Payment {
    pub fn new(
        loan_id: impl Into<String>,
        source: PaymentSource,
        external_ref: impl Into<String>,
        amount_cents: i64,
        currency: impl Into<String>,
        received_at: DateTime<Utc>,
        effective_date: NaiveDate,
        idempotency_key: impl Into<String>,
    ) -> Result<Self, PaymentError> {
        if amount_cents < 0 {
            return Err(PaymentError::NegativeAmount(amount_cents));
        }
        Ok(Self {
            payment_id: Ulid::new(),
            loan_id: loan_id.into(),
            source,
            external_ref: external_ref.into(),
            amount_cents,
            currency: currency.into(),
            received_at,
            effective_date,
            state: PaymentState::Received,
            idempotency_key: idempotency_key.into(),
            metadata: HashMap::new(),
        })
    }

    /// Attempt the transition, returning the [`StateTransition`] row to
    /// persist atomically alongside the new state (§3 lifecycle/ownership).
    pub fn transition(
        &mut self,
        next: PaymentState,
        actor: impl Into<String>,
        reason: Option<String>,
    ) -> Result<StateTransition, PaymentError> {
        if !self.state.can_transition_to(next) {
            return Err(PaymentError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        let transition = StateTransition {
            payment_id: self.payment_id,
            previous_state: self.state,
            new_state: next,
            occurred_at: Utc::now(),
            actor: actor.into(),
            reason,
        };
        self.state = next;
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Payment {
        Payment::new(
            "LOAN-1",
            PaymentSource::Ach,
            "trace-123",
            35_000,
            "USD",
            Utc::now(),
            Utc::now().date_naive(),
            "ach:trace-123:2026-07-31:35000",
        )
        .unwrap()
    }

    #[test]
    fn negative_amount_rejected() {
        let err = Payment::new(
            "LOAN-1",
            PaymentSource::Ach,
            "trace-123",
            -1,
            "USD",
            Utc::now(),
            Utc::now().date_naive(),
            "key",
        )
        .unwrap_err();
        assert_eq!(err, PaymentError::NegativeAmount(-1));
    }

    #[test]
    fn happy_path_transitions() {
        let mut p = sample();
        p.transition(PaymentState::Validated, "validation-consumer", None)
            .unwrap();
        p.transition(
            PaymentState::PostedPendingSettlement,
            "allocation-consumer",
            None,
        )
        .unwrap();
        p.transition(PaymentState::Processing, "distribution-engine", None)
            .unwrap();
        p.transition(PaymentState::Settled, "distribution-engine", None)
            .unwrap();
        assert!(p.state.is_terminal());
    }

    #[test]
    fn cannot_skip_states() {
        let mut p = sample();
        let err = p
            .transition(PaymentState::Settled, "validation-consumer", None)
            .unwrap_err();
        assert!(matches!(err, PaymentError::IllegalTransition { .. }));
    }

    #[test]
    fn settled_can_reverse_via_returned() {
        let mut p = sample();
        p.transition(PaymentState::Validated, "x", None).unwrap();
        p.transition(PaymentState::PostedPendingSettlement, "x", None)
            .unwrap();
        p.transition(PaymentState::Processing, "x", None).unwrap();
        p.transition(PaymentState::Settled, "x", None).unwrap();
        p.transition(PaymentState::Returned, "ach-return-handler", Some("R01".into()))
            .unwrap();
        p.transition(PaymentState::Reversed, "reversal-saga", None)
            .unwrap();
        assert!(p.state.is_terminal());
    }
}
