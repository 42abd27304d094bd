//! Idempotency record model (C4, §3/§4.4).
//!
//! The `(handler_name, idempotency_key)` pair is unique; `IdempotencyStore`
//! is the repository seam that `loanserve-storage` implements against
//! Postgres and `loanserve-worker`'s `wrap()` helper drives. Kept here
//! (rather than in `loanserve-storage`) because the *contract* — what states
//! exist, what `wrap()` must do with them — is domain logic independent of
//! the backing store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single idempotent handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyResultState {
    InFlight,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub handler_name: String,
    pub idempotency_key: String,
    pub result_state: IdempotencyResultState,
    pub created_at: DateTime<Utc>,
}

/// What the caller of `wrap()` should do given the existing record (or lack
/// thereof) for `(handler_name, idempotency_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyDecision {
    /// No record exists; a new `in_flight` row should be inserted and the
    /// handler's work should run inside the same local transaction.
    Proceed,
    /// A record exists in a terminal `done` state; short-circuit with
    /// success without re-running the handler.
    ShortCircuitDone,
    /// A record exists in `in_flight`; reject so the broker redelivers
    /// after the lock holder's transaction commits or rolls back.
    RejectInFlight,
}

/// Decide what to do for a lookup result, per §4.4's three-branch contract.
pub fn decide(existing: Option<&IdempotencyRecord>) -> IdempotencyDecision {
    match existing.map(|r| r.result_state) {
        None => IdempotencyDecision::Proceed,
        Some(IdempotencyResultState::Done) => IdempotencyDecision::ShortCircuitDone,
        Some(IdempotencyResultState::InFlight) => IdempotencyDecision::RejectInFlight,
        // A prior attempt failed outright (e.g. the process crashed before
        // updating the row); treat it the same as no record so the handler
        // gets to retry cleanly.
        Some(IdempotencyResultState::Failed) => IdempotencyDecision::Proceed,
    }
}

/// Repository seam for idempotency records, implemented against Postgres in
/// `loanserve-storage`. All three steps of `wrap()` — lookup, insert
/// `in_flight`, update to `done`/`failed` — must run in the caller's
/// transaction alongside the handler's own writes (§4.4).
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    type Tx: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn lookup(
        &self,
        tx: &mut Self::Tx,
        handler_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, Self::Error>;

    async fn mark_in_flight(
        &self,
        tx: &mut Self::Tx,
        handler_name: &str,
        idempotency_key: &str,
    ) -> Result<(), Self::Error>;

    async fn mark_done(
        &self,
        tx: &mut Self::Tx,
        handler_name: &str,
        idempotency_key: &str,
    ) -> Result<(), Self::Error>;

    async fn mark_failed(
        &self,
        tx: &mut Self::Tx,
        handler_name: &str,
        idempotency_key: &str,
    ) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: IdempotencyResultState) -> IdempotencyRecord {
        IdempotencyRecord {
            handler_name: "validation-consumer".into(),
            idempotency_key: "ach:trace:2026-07-31:35000".into(),
            result_state: state,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn no_record_proceeds() {
        assert_eq!(decide(None), IdempotencyDecision::Proceed);
    }

    #[test]
    fn done_short_circuits() {
        let r = record(IdempotencyResultState::Done);
        assert_eq!(decide(Some(&r)), IdempotencyDecision::ShortCircuitDone);
    }

    #[test]
    fn in_flight_is_rejected() {
        let r = record(IdempotencyResultState::InFlight);
        assert_eq!(decide(Some(&r)), IdempotencyDecision::RejectInFlight);
    }

    #[test]
    fn failed_is_retried() {
        let r = record(IdempotencyResultState::Failed);
        assert_eq!(decide(Some(&r)), IdempotencyDecision::Proceed);
    }
}
