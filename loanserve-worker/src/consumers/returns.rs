//! Returns handler (C11, §4.11). Normalizes webhook/manual intake for ACH
//! returns and wire recalls, dispatches to reverse/dispute/hold.

use async_trait::async_trait;
use loanserve_core::envelope::{Envelope, MessageFactory};
use loanserve_core::error::{CoreError, HandlerOutcome};
use loanserve_core::exceptions::{Category, ExceptionCase};
use loanserve_core::hash_chain;
use loanserve_core::returns::{
    ach_action, ach_bans_payment_method, ach_opens_dispute, ach_return_severity, wire_recall_action,
    ReturnAction, WireRecallReason,
};
use loanserve_broker::consumer::ConsumerHandler;
use loanserve_storage::events::EventRepository;
use loanserve_storage::exceptions::ExceptionCaseRepository;
use loanserve_storage::idempotency::PgIdempotencyStore;
use loanserve_storage::outbox::{NewOutboxMessage, OutboxRepository};
use loanserve_storage::payments::PaymentRepository;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::warn;
use ulid::Ulid;

use crate::saga::reversal;
use crate::wrap::{wrap, WrapOutcome};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "kind")]
enum ReturnCode {
    Ach { code: String, trace: String },
    WireRecall { reason: WireRecallReason, wire_ref: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ReturnIntakePayload {
    payment_id: Ulid,
    #[serde(flatten)]
    code: ReturnCode,
}

pub struct ReturnsConsumer {
    pool: PgPool,
    payments: PaymentRepository,
    events: EventRepository,
    outbox: OutboxRepository,
    exceptions: ExceptionCaseRepository,
    idempotency: PgIdempotencyStore,
    factory: MessageFactory,
}

impl ReturnsConsumer {
    pub fn new(
        pool: PgPool,
        payments: PaymentRepository,
        events: EventRepository,
        outbox: OutboxRepository,
        exceptions: ExceptionCaseRepository,
    ) -> Self {
        Self {
            pool,
            payments,
            events,
            outbox,
            exceptions,
            idempotency: PgIdempotencyStore,
            factory: MessageFactory::new("returns-consumer@1.0.0"),
        }
    }
}

#[async_trait]
impl ConsumerHandler for ReturnsConsumer {
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        let payload: ReturnIntakePayload = match serde_json::from_value(envelope.data.clone()) {
            Ok(p) => p,
            Err(err) => return HandlerOutcome::from_error(&CoreError::Validation(err.to_string())),
        };

        let idempotency_key = match &payload.code {
            ReturnCode::Ach { trace, .. } => format!("return:ach:{trace}"),
            ReturnCode::WireRecall { wire_ref, .. } => format!("return:wire:{wire_ref}"),
        };

        let result = wrap(&self.pool, &self.idempotency, "returns-consumer", &idempotency_key, |tx| {
            let payload = &payload;
            let envelope = &envelope;
            Box::pin(async move {
                let payment = match self
                    .payments
                    .find_by_id(&payload.payment_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?
                {
                    Some(p) => p,
                    None => {
                        let case = ExceptionCase::open(
                            Category::AchReturn,
                            "orphan_return",
                            loanserve_core::returns::Severity::Medium,
                        );
                        self.exceptions
                            .insert(tx, &case)
                            .await
                            .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                        return Ok(());
                    }
                };

                let (action, category, subcategory, severity, opens_dispute, bans_method) = match &payload.code {
                    ReturnCode::Ach { code, .. } => (
                        ach_action(code),
                        Category::AchReturn,
                        code.clone(),
                        ach_return_severity(code),
                        ach_opens_dispute(code),
                        ach_bans_payment_method(code),
                    ),
                    ReturnCode::WireRecall { reason, .. } => (
                        wire_recall_action(*reason),
                        Category::WireRecall,
                        format!("{reason:?}"),
                        loanserve_core::returns::Severity::High,
                        false,
                        false,
                    ),
                };

                if opens_dispute {
                    let case = ExceptionCase::open(Category::Dispute, subcategory.clone(), severity)
                        .with_payment(payment.payment_id);
                    self.exceptions
                        .insert(tx, &case)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                }
                if bans_method {
                    let case = ExceptionCase::open(category, format!("{subcategory}:ban_payment_method"), severity)
                        .with_payment(payment.payment_id);
                    self.exceptions
                        .insert(tx, &case)
                        .await
                        .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                }

                let type_suffix = match action {
                    ReturnAction::Retry => "retry",
                    ReturnAction::Reverse => "reverse",
                    ReturnAction::Hold => "hold",
                    ReturnAction::Dispute => "dispute",
                };

                let previous_event = self
                    .events
                    .latest(&payment.payment_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                let event_data = serde_json::json!({ "subcategory": subcategory, "severity": severity });
                let event = hash_chain::append_event(
                    payment.payment_id,
                    previous_event.as_ref(),
                    format!("return.{type_suffix}"),
                    event_data.clone(),
                    envelope.correlation_id,
                );
                self.events
                    .append(tx, &event)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let out_envelope = self.factory.reply(envelope, format!("loanserve.return.{type_suffix}"), event_data);
                let outbox_row = NewOutboxMessage {
                    aggregate_type: "payment".into(),
                    aggregate_id: payment.payment_id.to_string(),
                    event_type: format!("return.{type_suffix}"),
                    payload: serde_json::to_value(&out_envelope).map_err(|e| CoreError::Validation(e.to_string()))?,
                    exchange: "payments.topic".into(),
                    routing_key: format!("payment.return.{type_suffix}"),
                    correlation_id: envelope.correlation_id,
                };
                self.outbox
                    .insert(tx, &outbox_row)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                match action {
                    ReturnAction::Reverse => {
                        let saga_envelope = reversal::start(
                            &self.factory,
                            payment.payment_id,
                            payment.loan_id.clone(),
                            subcategory,
                            Some(envelope.correlation_id),
                        );
                        let saga_row = NewOutboxMessage {
                            aggregate_type: "payment".into(),
                            aggregate_id: payment.payment_id.to_string(),
                            event_type: "saga.payment.reversal.step".into(),
                            payload: serde_json::to_value(&saga_envelope)
                                .map_err(|e| CoreError::Validation(e.to_string()))?,
                            exchange: "payments.saga".into(),
                            routing_key: "saga.payment.reversal.step".into(),
                            correlation_id: envelope.correlation_id,
                        };
                        self.outbox
                            .insert(tx, &saga_row)
                            .await
                            .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                    }
                    ReturnAction::Retry | ReturnAction::Hold | ReturnAction::Dispute => {}
                }

                Ok(())
            })
        })
        .await;

        match result {
            Ok(WrapOutcome::Ran(())) => HandlerOutcome::Ack,
            Ok(WrapOutcome::ShortCircuitedDone) => HandlerOutcome::Ack,
            Ok(WrapOutcome::RejectedInFlight) => HandlerOutcome::Retry("return intake in flight".into()),
            Err(err) => {
                warn!(%err, "returns consumer failed");
                HandlerOutcome::from_error(&err)
            }
        }
    }
}
