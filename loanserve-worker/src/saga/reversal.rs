//! Reversal saga (C10, §4.10). Eight steps, each its own idempotent `wrap()`
//! transaction, chained by outbox-published step events carrying
//! `causation_id = previous_step.message_id` (§5 "per payment saga"
//! ordering guarantee). A step failure pauses the saga at that step and
//! opens an exception case instead of advancing.

use async_trait::async_trait;
use chrono::Utc;
use loanserve_core::envelope::{Envelope, MessageFactory};
use loanserve_core::error::{CoreError, HandlerOutcome};
use loanserve_core::exceptions::{Category, ExceptionCase};
use loanserve_core::hash_chain;
use loanserve_core::late_fee::{assess_late_fee, derive_loan_status};
use loanserve_core::payment::PaymentState;
use loanserve_core::returns::Severity;
use loanserve_broker::consumer::ConsumerHandler;
use loanserve_storage::distributions::DistributionRepository;
use loanserve_storage::escrow::EscrowRepository;
use loanserve_storage::events::EventRepository;
use loanserve_storage::exceptions::ExceptionCaseRepository;
use loanserve_storage::idempotency::PgIdempotencyStore;
use loanserve_storage::ledger::LedgerRepository;
use loanserve_storage::lock::lock_loan;
use loanserve_storage::outbox::{NewOutboxMessage, OutboxRepository};
use loanserve_storage::payments::PaymentRepository;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;
use ulid::Ulid;
use uuid::Uuid;

use crate::config::Settings;
use crate::wrap::{wrap, WrapOutcome};

pub const SCHEMA: &str = "loanserve.saga.reversal.step";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StepPayload {
    saga_id: Ulid,
    payment_id: Ulid,
    loan_id: String,
    step: u8,
    reason: String,
}

/// Kick off a reversal saga at step 1. Called by the returns handler (C11)
/// when a return code maps to [`loanserve_core::returns::ReturnAction::Reverse`].
pub fn start(factory: &MessageFactory, payment_id: Ulid, loan_id: String, reason: String, correlation_id: Option<Uuid>) -> Envelope {
    let saga_id = Ulid::new();
    factory.create(
        SCHEMA,
        serde_json::json!({
            "saga_id": saga_id,
            "payment_id": payment_id,
            "loan_id": loan_id,
            "step": 1u8,
            "reason": reason,
        }),
        loanserve_core::envelope::CreateOptions {
            correlation_id,
            idempotency_key: Some(format!("{saga_id}:step1")),
            ..Default::default()
        },
    )
}

/// `medium` for notification steps, `high` for ledger/escrow steps (§4.10).
fn severity_for_step(step: u8) -> Severity {
    match step {
        2 | 3 => Severity::High,
        _ => Severity::Medium,
    }
}

pub struct ReversalSaga {
    pool: PgPool,
    payments: PaymentRepository,
    ledger: LedgerRepository,
    escrow: EscrowRepository,
    distributions: DistributionRepository,
    events: EventRepository,
    outbox: OutboxRepository,
    exceptions: ExceptionCaseRepository,
    idempotency: PgIdempotencyStore,
    settings: Arc<Settings>,
    factory: MessageFactory,
}

impl ReversalSaga {
    pub fn new(
        pool: PgPool,
        payments: PaymentRepository,
        ledger: LedgerRepository,
        escrow: EscrowRepository,
        distributions: DistributionRepository,
        events: EventRepository,
        outbox: OutboxRepository,
        exceptions: ExceptionCaseRepository,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            pool,
            payments,
            ledger,
            escrow,
            distributions,
            events,
            outbox,
            exceptions,
            idempotency: PgIdempotencyStore,
            settings,
            factory: MessageFactory::new("reversal-saga@1.0.0"),
        }
    }

    async fn run_step(&self, envelope: &Envelope, payload: &StepPayload) -> Result<WrapOutcome<()>, CoreError> {
        let idempotency_key = format!("{}:step{}", payload.saga_id, payload.step);
        wrap(&self.pool, &self.idempotency, "reversal-saga", &idempotency_key, |tx| Box::pin(async move {
            lock_loan(tx, &payload.loan_id)
                .await
                .map_err(|e| CoreError::TransientIo(e.to_string()))?;

            match payload.step {
                1 => {
                    let mut payment = self
                        .payments
                        .find_by_id(&payload.payment_id)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?
                        .ok_or_else(|| CoreError::Ordering(format!("payment {} not found", payload.payment_id)))?;
                    let transition = payment
                        .transition(PaymentState::Returned, "reversal-saga", Some(payload.reason.clone()))
                        .map_err(|e| CoreError::Ordering(e.to_string()))?;
                    self.payments
                        .apply_transition(tx, &transition)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                }
                2 => {
                    let reversed = self
                        .ledger
                        .reverse(tx, &payload.payment_id)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                    self.emit_next(tx, envelope, payload, "loan.balance_adjustment.requested", serde_json::json!({
                        "loan_id": payload.loan_id,
                        "payment_id": payload.payment_id,
                        "deltas": reversed,
                    }))
                    .await?;
                }
                3 => {
                    self.escrow
                        .reverse(tx, &payload.loan_id, &payload.payment_id)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                }
                4 => {
                    let shares = self
                        .distributions
                        .clawback(tx, &payload.payment_id, &payload.saga_id.to_string())
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                    self.emit_next_to(
                        tx,
                        envelope,
                        payload,
                        "events.topic",
                        "distribution.clawback",
                        serde_json::json!({
                            "saga_id": payload.saga_id,
                            "payment_id": payload.payment_id,
                            "shares": shares,
                        }),
                    )
                    .await?;
                }
                5 => {
                    let payment = self
                        .payments
                        .find_by_id(&payload.payment_id)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?
                        .ok_or_else(|| CoreError::Ordering(format!("payment {} not found", payload.payment_id)))?;
                    let today = Utc::now().date_naive();
                    let late_fee = assess_late_fee(
                        payment.effective_date,
                        today,
                        self.settings.late_fee_grace_days,
                        self.settings.late_fee_flat_cents,
                    );
                    let next_payment_date = payment.effective_date + chrono::Duration::days(30);
                    self.emit_next(tx, envelope, payload, "loan.late_fee.recomputed", serde_json::json!({
                        "loan_id": payload.loan_id,
                        "payment_id": payload.payment_id,
                        "late_fee_cents": late_fee,
                        "next_payment_date": next_payment_date,
                    }))
                    .await?;
                }
                6 => {
                    let payment = self
                        .payments
                        .find_by_id(&payload.payment_id)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?
                        .ok_or_else(|| CoreError::Ordering(format!("payment {} not found", payload.payment_id)))?;
                    let today = Utc::now().date_naive();
                    let next_payment_date = payment.effective_date + chrono::Duration::days(30);
                    let status = derive_loan_status(next_payment_date, today, self.settings.late_fee_grace_days);
                    self.emit_next(tx, envelope, payload, "loan.status.recompute.requested", serde_json::json!({
                        "loan_id": payload.loan_id,
                        "derived_status": status,
                    }))
                    .await?;
                }
                7 => {
                    let outbox_row = NewOutboxMessage {
                        aggregate_type: "payment".into(),
                        aggregate_id: payload.payment_id.to_string(),
                        event_type: "notification.payment_reversed".into(),
                        payload: serde_json::to_value(self.factory.reply(envelope, "loanserve.notification.payment_reversed", serde_json::json!({
                            "payment_id": payload.payment_id,
                            "loan_id": payload.loan_id,
                            "reason": payload.reason,
                            "audience": ["borrower", "investor"],
                        }))).map_err(|e| CoreError::Validation(e.to_string()))?,
                        exchange: "payments.notifications".into(),
                        routing_key: "notification.payment_reversed".into(),
                        correlation_id: envelope.correlation_id,
                    };
                    self.outbox
                        .insert(tx, &outbox_row)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                }
                8 => {
                    let mut payment = self
                        .payments
                        .find_by_id(&payload.payment_id)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?
                        .ok_or_else(|| CoreError::Ordering(format!("payment {} not found", payload.payment_id)))?;
                    let transition = payment
                        .transition(PaymentState::Reversed, "reversal-saga", None)
                        .map_err(|e| CoreError::Ordering(e.to_string()))?;
                    self.payments
                        .apply_transition(tx, &transition)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                    let previous_event = self
                        .events
                        .latest(&payload.payment_id)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                    let event = hash_chain::append_event(
                        payload.payment_id,
                        previous_event.as_ref(),
                        "payment.reversed",
                        serde_json::json!({ "reason": payload.reason }),
                        envelope.correlation_id,
                    );
                    self.events
                        .append(tx, &event)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                }
                other => return Err(CoreError::Validation(format!("unknown reversal saga step {other}"))),
            }

            // Steps that don't call `emit_next` themselves still advance the
            // saga, except the terminal step.
            if !matches!(payload.step, 2 | 4 | 5 | 6) && payload.step < 8 {
                self.emit_next_step(tx, envelope, payload).await?;
            }

            Ok(())
        }))
        .await
    }

    async fn emit_next(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        envelope: &Envelope,
        payload: &StepPayload,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.emit_next_to(tx, envelope, payload, "payments.topic", event_type, data).await
    }

    async fn emit_next_to(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        envelope: &Envelope,
        payload: &StepPayload,
        exchange: &str,
        routing_key: &str,
        data: serde_json::Value,
    ) -> Result<(), CoreError> {
        let out_envelope = self.factory.reply(envelope, format!("loanserve.{routing_key}"), data);
        let outbox_row = NewOutboxMessage {
            aggregate_type: "payment".into(),
            aggregate_id: payload.payment_id.to_string(),
            event_type: routing_key.into(),
            payload: serde_json::to_value(&out_envelope).map_err(|e| CoreError::Validation(e.to_string()))?,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            correlation_id: envelope.correlation_id,
        };
        self.outbox
            .insert(tx, &outbox_row)
            .await
            .map_err(|e| CoreError::TransientIo(e.to_string()))?;
        self.emit_next_step(tx, envelope, payload).await
    }

    async fn emit_next_step(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        envelope: &Envelope,
        payload: &StepPayload,
    ) -> Result<(), CoreError> {
        if payload.step >= 8 {
            return Ok(());
        }
        let next_step = payload.step + 1;
        let next_payload = StepPayload { step: next_step, ..payload.clone() };
        let next_envelope = self.factory.reply(envelope, SCHEMA, serde_json::to_value(&next_payload).map_err(|e| CoreError::Validation(e.to_string()))?);
        let outbox_row = NewOutboxMessage {
            aggregate_type: "payment".into(),
            aggregate_id: payload.payment_id.to_string(),
            event_type: "saga.payment.reversal.step".into(),
            payload: serde_json::to_value(&next_envelope).map_err(|e| CoreError::Validation(e.to_string()))?,
            exchange: "payments.saga".into(),
            routing_key: "saga.payment.reversal.step".into(),
            correlation_id: envelope.correlation_id,
        };
        self.outbox
            .insert(tx, &outbox_row)
            .await
            .map_err(|e| CoreError::TransientIo(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ConsumerHandler for ReversalSaga {
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        let payload: StepPayload = match serde_json::from_value(envelope.data.clone()) {
            Ok(p) => p,
            Err(err) => return HandlerOutcome::from_error(&CoreError::Validation(err.to_string())),
        };

        match self.run_step(&envelope, &payload).await {
            Ok(WrapOutcome::Ran(())) | Ok(WrapOutcome::ShortCircuitedDone) => HandlerOutcome::Ack,
            Ok(WrapOutcome::RejectedInFlight) => HandlerOutcome::Retry("reversal step in flight".into()),
            Err(err @ CoreError::TransientIo(_)) => HandlerOutcome::from_error(&err),
            Err(err) => {
                warn!(%err, saga_id = %payload.saga_id, step = payload.step, "reversal saga step failed, pausing");
                let case = ExceptionCase::open(
                    Category::ReconcileVariance,
                    format!("reversal_saga_step_{}_failed", payload.step),
                    severity_for_step(payload.step),
                )
                .with_payment(payload.payment_id);
                match self.pool.begin().await {
                    Ok(mut tx) => {
                        if let Err(insert_err) = self.exceptions.insert(&mut tx, &case).await {
                            warn!(%insert_err, "failed to open exception case for paused reversal saga");
                        } else if let Err(commit_err) = tx.commit().await {
                            warn!(%commit_err, "failed to commit exception case for paused reversal saga");
                        }
                    }
                    Err(begin_err) => {
                        warn!(%begin_err, "failed to open transaction for paused reversal saga exception case");
                    }
                }
                HandlerOutcome::Ack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_emits_step_one_with_an_idempotency_key_derived_from_the_saga_id() {
        let factory = MessageFactory::new("returns-consumer@1.0.0");
        let envelope = start(&factory, Ulid::new(), "loan-1".into(), "R01".into(), None);
        assert_eq!(envelope.schema, SCHEMA);
        let payload: StepPayload = serde_json::from_value(envelope.data.clone()).unwrap();
        assert_eq!(payload.step, 1);
        assert_eq!(payload.reason, "R01");
        assert_eq!(envelope.idempotency_key.as_deref(), Some(format!("{}:step1", payload.saga_id).as_str()));
    }

    #[test]
    fn ledger_and_escrow_steps_are_high_severity_notification_steps_are_medium() {
        assert_eq!(severity_for_step(2), Severity::High);
        assert_eq!(severity_for_step(3), Severity::High);
        for step in [1, 4, 5, 6, 7, 8] {
            assert_eq!(severity_for_step(step), Severity::Medium);
        }
    }
}
