//! Distribution engine consumer (C9, §4.9). Prefetch 10.

use async_trait::async_trait;
use loanserve_core::distribution::distribute;
use loanserve_core::envelope::Envelope;
use loanserve_core::envelope::MessageFactory;
use loanserve_core::error::{CoreError, HandlerOutcome};
use loanserve_core::hash_chain;
use loanserve_core::payment::PaymentState;
use loanserve_broker::consumer::ConsumerHandler;
use loanserve_storage::distributions::DistributionRepository;
use loanserve_storage::events::EventRepository;
use loanserve_storage::idempotency::PgIdempotencyStore;
use loanserve_storage::ledger::target_interest_and_principal;
use loanserve_storage::outbox::{NewOutboxMessage, OutboxRepository};
use loanserve_storage::payments::PaymentRepository;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::warn;
use ulid::Ulid;

use crate::wrap::{wrap, WrapOutcome};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct DistributionRequestedPayload {
    payment_id: Ulid,
    loan_id: String,
}

pub struct DistributionConsumer {
    pool: PgPool,
    payments: PaymentRepository,
    distributions: DistributionRepository,
    events: EventRepository,
    outbox: OutboxRepository,
    idempotency: PgIdempotencyStore,
    servicing_bps: i64,
    factory: MessageFactory,
}

impl DistributionConsumer {
    pub fn new(
        pool: PgPool,
        payments: PaymentRepository,
        distributions: DistributionRepository,
        events: EventRepository,
        outbox: OutboxRepository,
        servicing_bps: i64,
    ) -> Self {
        Self {
            pool,
            payments,
            distributions,
            events,
            outbox,
            idempotency: PgIdempotencyStore,
            servicing_bps,
            factory: MessageFactory::new("distribution-consumer@1.0.0"),
        }
    }
}

#[async_trait]
impl ConsumerHandler for DistributionConsumer {
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        let payload: DistributionRequestedPayload = match serde_json::from_value(envelope.data.clone()) {
            Ok(p) => p,
            Err(err) => return HandlerOutcome::from_error(&CoreError::Validation(err.to_string())),
        };

        let idempotency_key = format!("distribute:{}", payload.payment_id);
        let result = wrap(&self.pool, &self.idempotency, "distribution-consumer", &idempotency_key, |tx| {
            let payload = &payload;
            let envelope = &envelope;
            Box::pin(async move {
                let mut payment = self
                    .payments
                    .find_by_id(&payload.payment_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?
                    .ok_or_else(|| CoreError::Ordering(format!("payment {} not found", payload.payment_id)))?;

                // Out-of-order step events ignored by checking current state
                // before acting (§5 "Per payment saga" ordering guarantee).
                if payment.state != PaymentState::PostedPendingSettlement {
                    return Err(CoreError::Ordering(format!(
                        "payment {} already in state {:?}",
                        payload.payment_id, payment.state
                    )));
                }

                let processing = payment
                    .transition(PaymentState::Processing, "distribution-consumer", None)
                    .map_err(|e| CoreError::Ordering(e.to_string()))?;
                self.payments
                    .apply_transition(tx, &processing)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let (interest_cents, principal_cents) =
                    target_interest_and_principal(tx, &payload.payment_id)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let positions = self
                    .distributions
                    .positions_for_loan(&payload.loan_id, payment.effective_date)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let shares = distribute(interest_cents, principal_cents, &positions, self.servicing_bps)
                    .map_err(|e| CoreError::Validation(e.to_string()))?;

                self.distributions
                    .record_shares(tx, &payload.payment_id, payment.effective_date, &shares)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let settled = payment
                    .transition(PaymentState::Settled, "distribution-consumer", None)
                    .map_err(|e| CoreError::Ordering(e.to_string()))?;
                self.payments
                    .apply_transition(tx, &settled)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let previous_event = self
                    .events
                    .latest(&payload.payment_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                let event_data = serde_json::to_value(&shares).map_err(|e| CoreError::Validation(e.to_string()))?;
                let event = hash_chain::append_event(
                    payload.payment_id,
                    previous_event.as_ref(),
                    "payment.settled",
                    event_data,
                    envelope.correlation_id,
                );
                self.events
                    .append(tx, &event)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let out_envelope = self.factory.reply(
                    envelope,
                    "loanserve.distribution.calculated",
                    serde_json::json!({ "payment_id": payload.payment_id, "loan_id": payload.loan_id, "shares": shares }),
                );
                let outbox_row = NewOutboxMessage {
                    aggregate_type: "payment".into(),
                    aggregate_id: payload.payment_id.to_string(),
                    event_type: "distribution.calculated".into(),
                    payload: serde_json::to_value(&out_envelope).map_err(|e| CoreError::Validation(e.to_string()))?,
                    exchange: "payments.topic".into(),
                    routing_key: "payment.distribution.calculated".into(),
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
            Ok(WrapOutcome::RejectedInFlight) => HandlerOutcome::Retry("distribution in flight".into()),
            Err(err) => {
                warn!(%err, "distribution consumer failed");
                HandlerOutcome::from_error(&err)
            }
        }
    }
}
