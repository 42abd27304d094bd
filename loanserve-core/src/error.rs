//! Shared error taxonomy and handler outcome tags.
//!
//! The consumer framework never lets handlers signal control flow through
//! exceptions (see the design note on replacing exceptions with tagged
//! results); handlers return a [`HandlerOutcome`] and the framework decides
//! ack/nack/DLQ from it.

use thiserror::Error;

/// Error kinds shared across the core, broker, storage, and worker crates.
///
/// Each crate may additionally define narrower, module-local error enums
/// (e.g. [`crate::payment::PaymentError`]); this enum is the common currency
/// at component boundaries, matching §7 of the specification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("business rejection: {0}")]
    BusinessRejection(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("ordering error: {0}")]
    Ordering(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result of a consumer handler, consumed by the broker's ack/nack framework.
///
/// This is the tagged-result replacement for exception-based control flow
/// described in the design notes: `Ack` on success, `Retry` for transient
/// failures (re-published to the `*.retry` ladder), `Dlq` for failures that
/// exhausted retries or are non-retryable by nature, and `Drop` for
/// messages that are safe to silently discard (e.g. an ordering error where
/// the aggregate already advanced past this step).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ack,
    Retry(String),
    Dlq(String),
    Drop(String),
}

impl HandlerOutcome {
    /// Derive the outcome a [`CoreError`] should produce, per the §7 error
    /// handling policy table.
    pub fn from_error(err: &CoreError) -> Self {
        match err {
            CoreError::TransientIo(reason) => HandlerOutcome::Retry(reason.clone()),
            CoreError::Validation(reason) | CoreError::BusinessRejection(reason) => {
                HandlerOutcome::Dlq(reason.clone())
            }
            CoreError::Conflict(_) => HandlerOutcome::Ack,
            CoreError::Ordering(reason) => HandlerOutcome::Drop(reason.clone()),
            CoreError::Integrity(reason) => HandlerOutcome::Dlq(format!("CRITICAL: {reason}")),
            CoreError::Config(reason) => HandlerOutcome::Dlq(reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_treated_as_success() {
        let err = CoreError::Conflict("duplicate idempotency key".into());
        assert_eq!(HandlerOutcome::from_error(&err), HandlerOutcome::Ack);
    }

    #[test]
    fn ordering_error_is_dropped_not_retried() {
        let err = CoreError::Ordering("payment already posted".into());
        assert!(matches!(
            HandlerOutcome::from_error(&err),
            HandlerOutcome::Drop(_)
        ));
    }

    #[test]
    fn transient_io_retries() {
        let err = CoreError::TransientIo("connection reset".into());
        assert!(matches!(
            HandlerOutcome::from_error(&err),
            HandlerOutcome::Retry(_)
        ));
    }
}
