//! Allocation & posting consumer (C8, §4.8). Subscribes to `payments.saga`
//! on routing key `saga.payment.start` (the `payments.allocation` queue),
//! filtered by schema since classification's saga-start envelope is the
//! only message ever published there.

use async_trait::async_trait;
use loanserve_core::allocation::{allocate, escrow_only, select_rules, AllocationTarget, TargetBalances};
use loanserve_core::envelope::{Envelope, MessageFactory};
use loanserve_core::error::{CoreError, HandlerOutcome};
use loanserve_core::hash_chain;
use loanserve_core::loan_directory::LoanDirectory;
use loanserve_core::payment::PaymentState;
use loanserve_broker::consumer::ConsumerHandler;
use loanserve_storage::allocation_rules::AllocationRuleRepository;
use loanserve_storage::escrow::{EscrowCategory, EscrowRepository};
use loanserve_storage::events::EventRepository;
use loanserve_storage::idempotency::PgIdempotencyStore;
use loanserve_storage::ledger::LedgerRepository;
use loanserve_storage::lock::lock_loan;
use loanserve_storage::outbox::{NewOutboxMessage, OutboxRepository};
use loanserve_storage::payments::PaymentRepository;
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;
use ulid::Ulid;

use crate::wrap::{wrap, WrapOutcome};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct SagaStartPayload {
    payment_id: Ulid,
    loan_id: String,
}

pub struct AllocationConsumer<L: LoanDirectory> {
    pool: PgPool,
    payments: PaymentRepository,
    rules: AllocationRuleRepository,
    ledger: LedgerRepository,
    escrow: EscrowRepository,
    events: EventRepository,
    outbox: OutboxRepository,
    idempotency: PgIdempotencyStore,
    loans: Arc<L>,
    factory: MessageFactory,
}

impl<L: LoanDirectory> AllocationConsumer<L> {
    pub fn new(
        pool: PgPool,
        payments: PaymentRepository,
        rules: AllocationRuleRepository,
        ledger: LedgerRepository,
        escrow: EscrowRepository,
        events: EventRepository,
        outbox: OutboxRepository,
        loans: Arc<L>,
    ) -> Self {
        Self {
            pool,
            payments,
            rules,
            ledger,
            escrow,
            events,
            outbox,
            idempotency: PgIdempotencyStore,
            loans,
            factory: MessageFactory::new("allocation-consumer@1.0.0"),
        }
    }
}

#[async_trait]
impl<L: LoanDirectory<Error = loanserve_storage::StorageError> + 'static> ConsumerHandler
    for AllocationConsumer<L>
{
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        if envelope.schema != "loanserve.saga.payment.start" {
            return HandlerOutcome::Ack;
        }

        let payload: SagaStartPayload = match serde_json::from_value(envelope.data.clone()) {
            Ok(p) => p,
            Err(err) => return HandlerOutcome::from_error(&CoreError::Validation(err.to_string())),
        };

        let idempotency_key = format!("allocate:{}", payload.payment_id);
        let result = wrap(&self.pool, &self.idempotency, "allocation-consumer", &idempotency_key, |tx| {
            let payload = &payload;
            let envelope = &envelope;
            Box::pin(async move {
                lock_loan(tx, &payload.loan_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let mut payment = self
                    .payments
                    .find_by_id(&payload.payment_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?
                    .ok_or_else(|| CoreError::Ordering(format!("payment {} not found", payload.payment_id)))?;

                // Already advanced past `validated` (redelivered saga-start):
                // nothing to do, ack.
                if payment.state != PaymentState::Validated {
                    return Err(CoreError::Ordering(format!(
                        "payment {} already in state {:?}",
                        payload.payment_id, payment.state
                    )));
                }

                let snapshot = self
                    .loans
                    .lookup(&payload.loan_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?
                    .ok_or_else(|| CoreError::BusinessRejection(format!("loan {} not found", payload.loan_id)))?;

                let escrow_balance = self
                    .escrow
                    .aggregate_balance(&payload.loan_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let balances = TargetBalances {
                    late_fee_balance: snapshot.balances.late_fee_balance,
                    accrued_interest: snapshot.balances.accrued_interest,
                    principal_balance: snapshot.balances.principal_balance,
                    escrow_shortage: escrow_balance.shortage_cents,
                    current_escrow: escrow_balance.balance_cents,
                };

                // The specific sub-account the payment's escrow portion
                // belongs to (tax/hazard/flood/mi); defaults to tax when the
                // payment carries no explicit category.
                let escrow_category = payment
                    .metadata
                    .get("escrow_category")
                    .and_then(|v| v.as_str())
                    .and_then(EscrowCategory::from_str)
                    .unwrap_or(EscrowCategory::Tax);

                let all_rules = self
                    .rules
                    .for_loan(&payload.loan_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                let mut rules = select_rules(&payload.loan_id, &all_rules);
                let is_escrow_only = payment
                    .metadata
                    .get("escrow_only")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if is_escrow_only {
                    rules = escrow_only(&rules);
                }

                let postings = allocate(payment.amount_cents, &rules, &balances)
                    .map_err(|e| CoreError::Validation(e.to_string()))?;

                self.ledger
                    .record_postings(tx, &payload.loan_id, &payment.payment_id, payment.effective_date, &postings)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                for posting in postings.iter().filter(|p| {
                    matches!(p.target, AllocationTarget::CurrentEscrow | AllocationTarget::EscrowShortage)
                }) {
                    self.escrow
                        .credit(tx, &payload.loan_id, escrow_category, &payment.payment_id, posting.amount_cents)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                }

                let transition = payment
                    .transition(PaymentState::PostedPendingSettlement, "allocation-consumer", None)
                    .map_err(|e| CoreError::Ordering(e.to_string()))?;
                self.payments
                    .apply_transition(tx, &transition)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let previous_event = self
                    .events
                    .latest(&payment.payment_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                let event_type = format!("payment.{}.posted", payment.source.as_str());
                let event_data = serde_json::to_value(&postings).map_err(|e| CoreError::Validation(e.to_string()))?;
                let event = hash_chain::append_event(
                    payment.payment_id,
                    previous_event.as_ref(),
                    event_type.clone(),
                    event_data,
                    envelope.correlation_id,
                );
                self.events
                    .append(tx, &event)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let out_envelope = self.factory.reply(
                    envelope,
                    format!("loanserve.{event_type}"),
                    serde_json::json!({
                        "payment_id": payment.payment_id,
                        "loan_id": payload.loan_id,
                        "postings": postings,
                    }),
                );
                let outbox_row = NewOutboxMessage {
                    aggregate_type: "payment".into(),
                    aggregate_id: payment.payment_id.to_string(),
                    event_type: event_type.clone(),
                    payload: serde_json::to_value(&out_envelope).map_err(|e| CoreError::Validation(e.to_string()))?,
                    exchange: "payments.topic".into(),
                    routing_key: event_type,
                    correlation_id: envelope.correlation_id,
                };
                self.outbox
                    .insert(tx, &outbox_row)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                Ok(())
            })
        })
        .await;

        match result {
            Ok(WrapOutcome::Ran(())) => HandlerOutcome::Ack,
            Ok(WrapOutcome::ShortCircuitedDone) => HandlerOutcome::Ack,
            Ok(WrapOutcome::RejectedInFlight) => HandlerOutcome::Retry("allocation in flight".into()),
            Err(err) => {
                warn!(%err, "allocation consumer failed");
                HandlerOutcome::from_error(&err)
            }
        }
    }
}
