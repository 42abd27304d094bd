//! LoanServe payment processing core
//!
//! Pure domain logic for the payment processing and settlement engine: the
//! message envelope, idempotency/hash-chain machinery, payment and ledger
//! data model, allocation waterfall, pro-rata distribution math, classifier
//! policy table, ACH/wire return code tables, and exception case model.
//!
//! # Critical invariants
//!
//! 1. All money values are `i64` cents.
//! 2. `message_id`/`payment_id` are lexicographically sortable (ULID).
//! 3. Nothing in this crate performs I/O — persistence and broker access are
//!    expressed as traits here and implemented in `loanserve-storage` /
//!    `loanserve-broker`.

pub mod allocation;
pub mod distribution;
pub mod envelope;
pub mod error;
pub mod exceptions;
pub mod hash_chain;
pub mod idempotency;
pub mod late_fee;
pub mod loan_directory;
pub mod payment;
pub mod policy;
pub mod returns;

pub use envelope::{Envelope, MessageFactory};
pub use error::{CoreError, HandlerOutcome};
pub use payment::{Payment, PaymentSource, PaymentState};
