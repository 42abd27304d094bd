//! Postgres-backed persistence for every repository seam
//! `loanserve-core`/`loanserve-worker` define (§6.5 table layout).
//!
//! Grounded on `ADORSYS-GIS-ledger-banking-rust`'s `banking-db` /
//! `banking-db-postgres` split: domain types and repository traits live
//! upstream (in `loanserve-core`), this crate only holds the sqlx wiring.

pub mod allocation_rules;
pub mod distributions;
pub mod error;
pub mod escrow;
pub mod events;
pub mod exceptions;
pub mod idempotency;
pub mod ingestions;
pub mod ledger;
pub mod loans;
pub mod lock;
pub mod outbox;
pub mod payments;
pub mod pool;
pub mod return_windows;

pub use error::StorageError;
pub use idempotency::PgIdempotencyStore;
pub use pool::{connect, run_migrations};
