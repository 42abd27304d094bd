//! Classifier consumer (C7, §4.7). Prefetch 25.

use async_trait::async_trait;
use loanserve_core::envelope::{Envelope, MessageFactory};
use loanserve_core::error::{CoreError, HandlerOutcome};
use loanserve_core::exceptions::{Category, ExceptionCase};
use loanserve_core::hash_chain;
use loanserve_core::loan_directory::LoanDirectory;
use loanserve_core::policy::{classify, ClassifierConfig, Classification};
use loanserve_core::returns::Severity;
use loanserve_broker::consumer::ConsumerHandler;
use loanserve_storage::events::EventRepository;
use loanserve_storage::exceptions::ExceptionCaseRepository;
use loanserve_storage::idempotency::PgIdempotencyStore;
use loanserve_storage::outbox::{NewOutboxMessage, OutboxRepository};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;
use ulid::Ulid;

use crate::wrap::{wrap_finish, wrap_start, WrapStart};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ClassifyPayload {
    payment_id: Ulid,
    loan_id: String,
}

pub struct ClassificationConsumer<L: LoanDirectory> {
    pool: PgPool,
    outbox: OutboxRepository,
    events: EventRepository,
    exceptions: ExceptionCaseRepository,
    idempotency: PgIdempotencyStore,
    loans: Arc<L>,
    classifier_config: ClassifierConfig,
    factory: MessageFactory,
}

impl<L: LoanDirectory> ClassificationConsumer<L> {
    pub fn new(
        pool: PgPool,
        outbox: OutboxRepository,
        events: EventRepository,
        exceptions: ExceptionCaseRepository,
        loans: Arc<L>,
        classifier_config: ClassifierConfig,
    ) -> Self {
        Self {
            pool,
            outbox,
            events,
            exceptions,
            idempotency: PgIdempotencyStore,
            loans,
            classifier_config,
            factory: MessageFactory::new("classification-consumer@1.0.0"),
        }
    }
}

#[async_trait]
impl<L: LoanDirectory<Error = loanserve_storage::StorageError> + 'static> ConsumerHandler
    for ClassificationConsumer<L>
{
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        let payload: ClassifyPayload = match serde_json::from_value(envelope.data.clone()) {
            Ok(p) => p,
            Err(err) => return HandlerOutcome::from_error(&CoreError::Validation(err.to_string())),
        };

        let idempotency_key = format!("classify:{}", payload.payment_id);
        let mut tx = match wrap_start(&self.pool, &self.idempotency, "classification-consumer", &idempotency_key).await {
            Ok(WrapStart::Proceed(tx)) => tx,
            Ok(WrapStart::ShortCircuitedDone) => return HandlerOutcome::Ack,
            Ok(WrapStart::RejectedInFlight) => return HandlerOutcome::Retry("classification in flight".into()),
            Err(err) => {
                warn!(%err, "classification consumer failed");
                return HandlerOutcome::from_error(&err);
            }
        };

        let result: Result<(), CoreError> = async {
            let tx = &mut tx;
            let payload = &payload;
            let envelope = &envelope;
            let snapshot = self
                    .loans
                    .lookup(&payload.loan_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let classification = classify(snapshot.map(|s| s.context()), &self.classifier_config);

                let policy = match classification {
                    Classification::MissingLoan => {
                        let case = ExceptionCase::open(
                            Category::ReconcileVariance,
                            "loan_state_missing",
                            Severity::Medium,
                        )
                        .with_payment(payload.payment_id);
                        self.exceptions
                            .insert(tx, &case)
                            .await
                            .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                        loanserve_core::policy::Policy::Conservative
                    }
                    Classification::Policy(policy) => policy,
                };
                let config = loanserve_core::policy::config_for(policy);

                let previous_event = self
                    .events
                    .latest(&payload.payment_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                let event_data = serde_json::to_value(&config).map_err(|e| CoreError::Validation(e.to_string()))?;
                let event = hash_chain::append_event(
                    payload.payment_id,
                    previous_event.as_ref(),
                    "payment.classified",
                    event_data.clone(),
                    envelope.correlation_id,
                );
                self.events
                    .append(tx, &event)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let saga_envelope = self.factory.reply(envelope, "loanserve.saga.payment.start", serde_json::json!({
                    "payment_id": payload.payment_id,
                    "loan_id": payload.loan_id,
                    "policy_config": config,
                }));
                let outbox_row = NewOutboxMessage {
                    aggregate_type: "payment".into(),
                    aggregate_id: payload.payment_id.to_string(),
                    event_type: "saga.payment.start".into(),
                    payload: serde_json::to_value(&saga_envelope).map_err(|e| CoreError::Validation(e.to_string()))?,
                    exchange: "payments.saga".into(),
                    routing_key: "saga.payment.start".into(),
                    correlation_id: envelope.correlation_id,
                };
                self.outbox
                    .insert(tx, &outbox_row)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => match wrap_finish(tx, &self.idempotency, "classification-consumer", &idempotency_key).await {
                Ok(()) => HandlerOutcome::Ack,
                Err(err) => {
                    warn!(%err, "classification consumer failed");
                    HandlerOutcome::from_error(&err)
                }
            },
            Err(err) => {
                warn!(%err, "classification consumer failed");
                HandlerOutcome::from_error(&err)
            }
        }
    }
}
