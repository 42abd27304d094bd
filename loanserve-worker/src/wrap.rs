//! Idempotent handler wrapper (C4, §4.4): `wrap_start`/`wrap_finish` look up
//! `(name, key)`, short-circuit on a terminal `done` record, reject a
//! concurrent `in_flight` one, otherwise mark `in_flight` and hand the caller
//! a transaction to run its handler in, which it later commits (alongside
//! marking `done`) via `wrap_finish`.
//!
//! Split into two calls (rather than a single function taking a handler
//! closure) because the handler needs to borrow both the transaction and the
//! enclosing `&self`/payload for the duration of its own async body, which a
//! closure parameterized only over the transaction's lifetime can't express.

use loanserve_core::error::CoreError;
use loanserve_core::idempotency::{decide, IdempotencyDecision, IdempotencyStore};
use sqlx::{PgPool, Postgres, Transaction};

pub enum WrapOutcome<T> {
    Ran(T),
    ShortCircuitedDone,
    RejectedInFlight,
}

/// Result of [`wrap_start`]: either the caller proceeds with the given
/// transaction (which it must later pass to [`wrap_finish`]), or the call is
/// short-circuited/rejected by the idempotency record.
pub enum WrapStart {
    Proceed(Transaction<'static, Postgres>),
    ShortCircuitedDone,
    RejectedInFlight,
}

/// Begins the transaction and performs the idempotency bookkeeping that used
/// to run at the top of `wrap`. On [`WrapStart::Proceed`] the caller must run
/// its handler against the returned transaction and then call
/// [`wrap_finish`] to mark `done` and commit.
pub async fn wrap_start<S>(
    pool: &PgPool,
    store: &S,
    handler_name: &str,
    idempotency_key: &str,
) -> Result<WrapStart, CoreError>
where
    S: IdempotencyStore<Tx = Transaction<'static, Postgres>>,
{
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CoreError::TransientIo(e.to_string()))?;

    let existing = store
        .lookup(&mut tx, handler_name, idempotency_key)
        .await
        .map_err(|e| CoreError::TransientIo(e.to_string()))?;

    match decide(existing.as_ref()) {
        IdempotencyDecision::ShortCircuitDone => Ok(WrapStart::ShortCircuitedDone),
        IdempotencyDecision::RejectInFlight => Ok(WrapStart::RejectedInFlight),
        IdempotencyDecision::Proceed => {
            store
                .mark_in_flight(&mut tx, handler_name, idempotency_key)
                .await
                .map_err(|e| CoreError::TransientIo(e.to_string()))?;

            Ok(WrapStart::Proceed(tx))
        }
    }
}

/// Marks `done` and commits the transaction handed out by [`wrap_start`].
/// On the handler's failure, callers should drop `tx` instead (rolling it
/// back, including the `in_flight` row) so a subsequent attempt sees no
/// record and proceeds cleanly rather than getting stuck behind a row marked
/// `failed`.
pub async fn wrap_finish<S>(
    mut tx: Transaction<'static, Postgres>,
    store: &S,
    handler_name: &str,
    idempotency_key: &str,
) -> Result<(), CoreError>
where
    S: IdempotencyStore<Tx = Transaction<'static, Postgres>>,
{
    store
        .mark_done(&mut tx, handler_name, idempotency_key)
        .await
        .map_err(|e| CoreError::TransientIo(e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| CoreError::TransientIo(e.to_string()))?;

    Ok(())
}
