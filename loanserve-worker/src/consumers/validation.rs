//! Validation consumer (C6, §4.6). Prefetch 10 (`loanserve-broker::topology`).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use loanserve_core::envelope::{CreateOptions, Envelope, MessageFactory};
use loanserve_core::error::{CoreError, HandlerOutcome};
use loanserve_core::hash_chain;
use loanserve_core::loan_directory::LoanDirectory;
use loanserve_core::payment::{Payment, PaymentSource, PaymentState};
use loanserve_broker::consumer::ConsumerHandler;
use loanserve_storage::events::EventRepository;
use loanserve_storage::idempotency::PgIdempotencyStore;
use loanserve_storage::outbox::{NewOutboxMessage, OutboxRepository};
use loanserve_storage::payments::PaymentRepository;
use loanserve_storage::return_windows::ReturnWindowRepository;
use regex::Regex;
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;

use crate::config::Settings;
use crate::wrap::{wrap, WrapOutcome};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct AchFields {
    routing_number: String,
    trace: String,
    sec_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct WireFields {
    wire_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct CheckFields {
    check_number: String,
    payer_account: String,
    issue_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ReceivedPaymentPayload {
    loan_id: String,
    source: PaymentSource,
    external_ref: String,
    amount_cents: i64,
    currency: String,
    received_at: DateTime<Utc>,
    effective_date: NaiveDate,
    ach: Option<AchFields>,
    wire: Option<WireFields>,
    check: Option<CheckFields>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, serde_json::Value>,
}

fn ach_window_days(sec_code: &str, default_days: i64) -> i64 {
    match sec_code {
        "PPD" | "CCD" => 2,
        "WEB" | "TEL" => 60,
        _ => default_days,
    }
}

pub struct ValidationConsumer<L: LoanDirectory> {
    pool: PgPool,
    payments: PaymentRepository,
    outbox: OutboxRepository,
    events: EventRepository,
    return_windows: ReturnWindowRepository,
    idempotency: PgIdempotencyStore,
    loans: Arc<L>,
    factory: MessageFactory,
    settings: Arc<Settings>,
    ach_routing_re: Regex,
}

impl<L: LoanDirectory> ValidationConsumer<L> {
    pub fn new(
        pool: PgPool,
        payments: PaymentRepository,
        outbox: OutboxRepository,
        events: EventRepository,
        return_windows: ReturnWindowRepository,
        loans: Arc<L>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            pool,
            payments,
            outbox,
            events,
            return_windows,
            idempotency: PgIdempotencyStore,
            loans,
            factory: MessageFactory::new("validation-consumer@1.0.0"),
            settings,
            ach_routing_re: Regex::new(r"^\d{9}$").expect("static regex"),
        }
    }

    fn idempotency_key(&self, payload: &ReceivedPaymentPayload) -> String {
        let date = payload.effective_date;
        match payload.source {
            PaymentSource::Ach => format!(
                "ach:{}:{}:{}",
                payload.ach.as_ref().map(|a| a.trace.as_str()).unwrap_or(""),
                date,
                payload.amount_cents
            ),
            PaymentSource::Wire => format!(
                "wire:{}:{}:{}",
                payload.wire.as_ref().map(|w| w.wire_ref.as_str()).unwrap_or(""),
                date,
                payload.amount_cents
            ),
            PaymentSource::Check | PaymentSource::Lockbox => format!(
                "check:{}:{}:{}",
                payload.check.as_ref().map(|c| c.check_number.as_str()).unwrap_or(""),
                payload.check.as_ref().map(|c| c.payer_account.as_str()).unwrap_or(""),
                payload.amount_cents
            ),
            _ => format!("{}:{}:{}:{}", payload.source.as_str(), payload.external_ref, date, payload.amount_cents),
        }
    }

    /// Source-specific checks from §4.6 step 4. `Ok(())` means the payment
    /// may proceed to `validated`; `Err` carries the rejection reason.
    async fn source_specific_checks(
        &self,
        payload: &ReceivedPaymentPayload,
    ) -> Result<(), String> {
        match payload.source {
            PaymentSource::Ach => {
                let ach = payload.ach.as_ref().ok_or("missing ach fields")?;
                if !self.ach_routing_re.is_match(&ach.routing_number) {
                    return Err(format!("invalid ACH routing number {}", ach.routing_number));
                }
                if !matches!(ach.sec_code.as_str(), "PPD" | "CCD" | "WEB" | "TEL") {
                    return Err(format!("unsupported SEC code {}", ach.sec_code));
                }
                Ok(())
            }
            PaymentSource::Wire => {
                let wire = payload.wire.as_ref().ok_or("missing wire fields")?;
                if wire.wire_ref.trim().is_empty() {
                    return Err("empty wire_ref".into());
                }
                Ok(())
            }
            PaymentSource::Check | PaymentSource::Lockbox => {
                let check = payload.check.as_ref().ok_or("missing check fields")?;
                let today = Utc::now().date_naive();
                let oldest_allowed = today - chrono::Duration::days(self.settings.check_stale_days);
                if check.issue_date < oldest_allowed || check.issue_date > today {
                    return Err(format!("check issue_date {} outside staleness window", check.issue_date));
                }
                if let Some(dup) = self
                    .payments
                    .find_duplicate_check(&check.check_number, &check.payer_account, payload.amount_cents)
                    .await
                    .map_err(|e| e.to_string())?
                {
                    return Err(format!("duplicate of payment {}", dup.payment_id));
                }
                Ok(())
            }
            PaymentSource::Card => {
                if payload.amount_cents > 1_000_000 {
                    return Err(format!("card amount {} exceeds ceiling", payload.amount_cents));
                }
                Ok(())
            }
            PaymentSource::Cashier | PaymentSource::MoneyOrder => Ok(()),
        }
    }
}

#[async_trait]
impl<L: LoanDirectory<Error = loanserve_storage::StorageError> + 'static> ConsumerHandler
    for ValidationConsumer<L>
{
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        let payload: ReceivedPaymentPayload = match serde_json::from_value(envelope.data.clone()) {
            Ok(p) => p,
            Err(err) => return HandlerOutcome::from_error(&CoreError::Validation(err.to_string())),
        };

        // Step 1: duplicate detection by business idempotency key, cheaply,
        // ahead of the full `wrap()` transaction.
        let idempotency_key = self.idempotency_key(&payload);
        match self.payments.find_by_idempotency_key(&idempotency_key).await {
            Ok(Some(_)) => return HandlerOutcome::Ack,
            Ok(None) => {}
            Err(err) => return HandlerOutcome::from_error(&CoreError::TransientIo(err.to_string())),
        }

        let result = wrap(&self.pool, &self.idempotency, "validation-consumer", &idempotency_key, |tx| {
            let payload = &payload;
            let envelope = &envelope;
            let idempotency_key = &idempotency_key;
            Box::pin(async move {
                let snapshot = self
                    .loans
                    .lookup(&payload.loan_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let mut payment = Payment::new(
                    payload.loan_id.clone(),
                    payload.source,
                    payload.external_ref.clone(),
                    payload.amount_cents,
                    payload.currency.clone(),
                    payload.received_at,
                    payload.effective_date,
                    idempotency_key.clone(),
                )
                .map_err(|e| CoreError::Validation(e.to_string()))?;
                payment.metadata = payload.metadata.clone();

                self.payments
                    .insert(tx, &payment)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let rejection: Option<String> = match &snapshot {
                    None => Some(format!("loan {} not found", payload.loan_id)),
                    Some(s) if !s.accepts_payments() => {
                        Some(format!("loan {} is not accepting payments", payload.loan_id))
                    }
                    Some(s)
                        if !s.accept_partial_payments
                            && payload.amount_cents
                                < s.balances.late_fee_balance
                                    + s.balances.accrued_interest
                                    + s.balances.principal_balance =>
                    {
                        Some("partial payments not accepted for this loan".to_string())
                    }
                    Some(_) => match self.source_specific_checks(payload).await {
                        Ok(()) => None,
                        Err(reason) => Some(reason),
                    },
                };

                let (new_state, event_suffix) = match &rejection {
                    None => (PaymentState::Validated, "validated"),
                    Some(_) => (PaymentState::Rejected, "rejected"),
                };

                let transition = payment
                    .transition(new_state, "validation-consumer", rejection.clone())
                    .map_err(|e| CoreError::Ordering(e.to_string()))?;
                self.payments
                    .apply_transition(tx, &transition)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                if rejection.is_none() {
                    if let (PaymentSource::Ach, Some(ach)) = (payload.source, &payload.ach) {
                        let window_days = ach_window_days(&ach.sec_code, self.settings.ach_return_window_default_days);
                        self.return_windows
                            .open(
                                &payment.payment_id,
                                &ach.sec_code,
                                window_days as i32,
                                payload.effective_date + chrono::Duration::days(window_days),
                            )
                            .await
                            .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                    }
                }

                let previous_event = self
                    .events
                    .latest(&payment.payment_id)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;
                let event_data = serde_json::json!({ "reason": rejection, "amount_cents": payload.amount_cents });
                let event = hash_chain::append_event(
                    payment.payment_id,
                    previous_event.as_ref(),
                    format!("payment.{}.{}", payload.source.as_str(), event_suffix),
                    event_data.clone(),
                    envelope.correlation_id,
                );
                self.events
                    .append(tx, &event)
                    .await
                    .map_err(|e| CoreError::TransientIo(e.to_string()))?;

                let schema = format!("loanserve.payment.{}.{}", payload.source.as_str(), event_suffix);
                let out_envelope = self.factory.reply(envelope, schema.clone(), event_data);
                let outbox_row = NewOutboxMessage {
                    aggregate_type: "payment".into(),
                    aggregate_id: payment.payment_id.to_string(),
                    event_type: schema,
                    payload: serde_json::to_value(&out_envelope).map_err(|e| CoreError::Validation(e.to_string()))?,
                    exchange: "payments.topic".into(),
                    routing_key: format!(
                        "payment.{}.{}",
                        payload.source.as_str(),
                        event_suffix
                    ),
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
            Ok(WrapOutcome::RejectedInFlight) => HandlerOutcome::Retry("validation in flight".into()),
            Err(err) => {
                warn!(%err, "validation consumer failed");
                HandlerOutcome::from_error(&err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_sec_codes_get_the_longer_regulation_e_window() {
        assert_eq!(ach_window_days("WEB", 5), 60);
        assert_eq!(ach_window_days("TEL", 5), 60);
    }

    #[test]
    fn corporate_sec_codes_get_the_shorter_window() {
        assert_eq!(ach_window_days("PPD", 5), 2);
        assert_eq!(ach_window_days("CCD", 5), 2);
    }

    #[test]
    fn unrecognized_sec_code_falls_back_to_the_configured_default() {
        assert_eq!(ach_window_days("ARC", 7), 7);
    }
}

