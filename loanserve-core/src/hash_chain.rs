//! Per-aggregate event hash chain (C4, §4.4).
//!
//! `payment_events` rows bind each payment's history into a tamper-evident
//! chain: `event_hash = SHA-256(prev_event_hash ∥ canonical(data) ∥
//! correlation_id ∥ timestamp)`, genesis `SHA-256("genesis:" ∥ payment_id)`.
//! Verification walks the sequence and recomputes, localizing tampering to
//! the first broken link — mirrors
//! `ibank-core::ledger::AppendOnlyLedger::verify_chain`'s walk, generalized
//! to the spec's exact hash formula (SHA-256 rather than the teacher's
//! blake3) and field set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use ulid::Ulid;
use uuid::Uuid;

/// A single hash-chained event for one payment aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub event_id: Ulid,
    pub payment_id: Ulid,
    pub event_type: String,
    pub data: Value,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("hash chain broken at event index {index} (event_id={event_id})")]
    Broken { index: usize, event_id: Ulid },
    #[error("empty chain")]
    Empty,
}

/// `SHA-256("genesis:" ∥ payment_id)`, hex-encoded.
pub fn genesis_hash(payment_id: Ulid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"genesis:");
    hasher.update(payment_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical JSON encoding used as hash input: `serde_json`'s default map
/// ordering is insertion order, so callers must construct `data` with a
/// stable key order (the payment handlers always build it fresh from a
/// fixed struct, which serializes deterministically).
fn canonical_json(data: &Value) -> Vec<u8> {
    serde_json::to_vec(data).expect("Value is always serializable")
}

fn compute_hash(
    prev_event_hash: &str,
    data: &Value,
    correlation_id: Uuid,
    timestamp: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_event_hash.as_bytes());
    hasher.update(canonical_json(data));
    hasher.update(correlation_id.as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the next event in a payment's chain. Pure function: callers persist
/// the returned [`PaymentEvent`] themselves, typically in the same
/// transaction as the state change it documents.
pub fn append_event(
    payment_id: Ulid,
    previous: Option<&PaymentEvent>,
    event_type: impl Into<String>,
    data: Value,
    correlation_id: Uuid,
) -> PaymentEvent {
    let prev_hash = previous
        .map(|e| e.event_hash.clone())
        .unwrap_or_else(|| genesis_hash(payment_id));
    let timestamp = Utc::now();
    let event_hash = compute_hash(&prev_hash, &data, correlation_id, timestamp);
    PaymentEvent {
        event_id: Ulid::new(),
        payment_id,
        event_type: event_type.into(),
        data,
        correlation_id,
        timestamp,
        prev_event_hash: Some(prev_hash),
        event_hash,
    }
}

/// Walk `events` in order, recomputing each hash, and return the index of
/// the first mismatch if tampering is detected.
pub fn verify_chain(payment_id: Ulid, events: &[PaymentEvent]) -> Result<(), ChainError> {
    if events.is_empty() {
        return Err(ChainError::Empty);
    }
    let mut expected_prev = genesis_hash(payment_id);
    for (index, event) in events.iter().enumerate() {
        let expected_hash = compute_hash(
            &expected_prev,
            &event.data,
            event.correlation_id,
            event.timestamp,
        );
        if event.prev_event_hash.as_deref() != Some(expected_prev.as_str())
            || event.event_hash != expected_hash
        {
            return Err(ChainError::Broken {
                index,
                event_id: event.event_id,
            });
        }
        expected_prev = event.event_hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_verifies_after_sequential_appends() {
        let payment_id = Ulid::new();
        let corr = Uuid::new_v4();
        let e1 = append_event(payment_id, None, "payment.received", json!({"a": 1}), corr);
        let e2 = append_event(
            payment_id,
            Some(&e1),
            "payment.validated",
            json!({"a": 2}),
            corr,
        );
        assert!(verify_chain(payment_id, &[e1, e2]).is_ok());
    }

    #[test]
    fn tampered_payload_is_detected_at_the_right_index() {
        let payment_id = Ulid::new();
        let corr = Uuid::new_v4();
        let e1 = append_event(payment_id, None, "payment.received", json!({"a": 1}), corr);
        let mut e2 = append_event(
            payment_id,
            Some(&e1),
            "payment.validated",
            json!({"a": 2}),
            corr,
        );
        e2.data = json!({"a": 999});
        let err = verify_chain(payment_id, &[e1, e2]).unwrap_err();
        assert_eq!(
            err,
            ChainError::Broken {
                index: 1,
                event_id: err_event_id(&err)
            }
        );
    }

    fn err_event_id(err: &ChainError) -> Ulid {
        match err {
            ChainError::Broken { event_id, .. } => *event_id,
            _ => panic!("expected Broken"),
        }
    }

    #[test]
    fn empty_chain_is_an_error() {
        assert_eq!(verify_chain(Ulid::new(), &[]), Err(ChainError::Empty));
    }
}
