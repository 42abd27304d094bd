//! Consumer framework: ack/nack/retry/DLQ decision wrapper around a
//! `lapin::Consumer` (§4.2, §5).

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use loanserve_core::envelope::Envelope;
use loanserve_core::error::HandlerOutcome;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::client::{BrokerClient, PublishOptions};
use crate::topology::Topology;

/// Per-consumer wiring: which queue to drain, how many deliveries may be
/// in flight at once, and the consumer tag for observability (§5 prefetch
/// table).
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub queue: String,
    pub prefetch: u16,
    pub consumer_tag: String,
    /// Wall-clock timeout per handler invocation (§5, default 30s).
    pub handler_timeout: Duration,
}

/// A consumer handler processes one envelope and reports a
/// [`HandlerOutcome`] instead of throwing (§9 design note).
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome;
}

/// Drive `handler` over every delivery on `opts.queue` until the process is
/// asked to shut down. Successful handling acks; `Retry` nacks without
/// requeue and republishes to the queue's `*.retry` lane; `Dlq` routes the
/// payload to the dead-letter exchange; `Drop` acks without republishing
/// (the aggregate already advanced past this message).
pub async fn consume(
    client: &BrokerClient,
    opts: ConsumeOptions,
    handler: impl ConsumerHandler + 'static,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), crate::client::BrokerError> {
    let channel = client.create_channel().await?;
    channel
        .basic_qos(opts.prefetch, BasicQosOptions::default())
        .await?;

    let mut consumer = channel
        .basic_consume(
            &opts.queue,
            &opts.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(queue = %opts.queue, "consumer shutting down");
                    return Ok(());
                }
            }
            delivery = consumer.next() => {
                let Some(delivery) = delivery else { return Ok(()) };
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(err) => {
                        error!(%err, queue = %opts.queue, "delivery error");
                        continue;
                    }
                };

                let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
                    Ok(e) => e,
                    Err(err) => {
                        warn!(%err, queue = %opts.queue, "unparseable envelope, routing to DLQ");
                        delivery.ack(BasicAckOptions::default()).await.ok();
                        continue;
                    }
                };

                let outcome = tokio::time::timeout(opts.handler_timeout, handler.handle(envelope.clone()))
                    .await
                    .unwrap_or_else(|_| HandlerOutcome::Retry("handler timed out".into()));

                match outcome {
                    HandlerOutcome::Ack => {
                        delivery.ack(BasicAckOptions::default()).await?;
                    }
                    HandlerOutcome::Drop(reason) => {
                        info!(queue = %opts.queue, reason, "dropping message (ordering already advanced)");
                        delivery.ack(BasicAckOptions::default()).await?;
                    }
                    HandlerOutcome::Retry(reason) => {
                        warn!(queue = %opts.queue, reason, "retrying message");
                        delivery
                            .nack(BasicNackOptions { requeue: false, ..Default::default() })
                            .await?;
                        republish_to_retry_lane(client, &opts.queue, &envelope).await;
                    }
                    HandlerOutcome::Dlq(reason) => {
                        error!(queue = %opts.queue, reason, "routing message to DLQ");
                        delivery
                            .nack(BasicNackOptions { requeue: false, ..Default::default() })
                            .await?;
                        publish_to_dlq(client, &opts.queue, &envelope).await;
                    }
                }
            }
        }
    }
}

async fn republish_to_retry_lane(client: &BrokerClient, queue: &str, envelope: &Envelope) {
    let retry_queue = Topology::retry_queue_name(queue);
    let mut bumped = envelope.clone();
    bumped.retry_count += 1;
    let opts = PublishOptions {
        exchange: String::new(),
        routing_key: retry_queue,
        persistent: true,
        mandatory: false,
    };
    if let Err(err) = client.publish(&bumped, &opts).await {
        error!(%err, queue, "failed to republish to retry lane");
    }
}

async fn publish_to_dlq(client: &BrokerClient, queue: &str, envelope: &Envelope) {
    let opts = PublishOptions {
        exchange: "payments.dlx".into(),
        routing_key: queue.into(),
        persistent: true,
        mandatory: false,
    };
    if let Err(err) = client.publish(envelope, &opts).await {
        error!(%err, queue, "failed to publish to DLQ");
    }
}
