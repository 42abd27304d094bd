//! Broker client: connection management and the publish-with-confirm
//! contract (§4.2).

use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use loanserve_core::envelope::Envelope;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::topology::Topology;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("publish was not confirmed by the broker")]
    Unconfirmed,
    #[error("envelope serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Options accepted by [`BrokerClient::publish`].
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub exchange: String,
    pub routing_key: String,
    pub persistent: bool,
    pub mandatory: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            routing_key: String::new(),
            persistent: true,
            mandatory: false,
        }
    }
}

/// Thin wrapper over a `lapin::Connection` providing the topology
/// provisioning, publish-with-confirm, and reconnect behaviors §4.2
/// describes. One `BrokerClient` per process; consumers each open their own
/// channel from it (see [`crate::consumer`]).
pub struct BrokerClient {
    connection: Connection,
}

impl BrokerClient {
    /// Connect with a bounded exponential-reconnect loop. `max_attempts =
    /// None` retries forever (the worker's top-level startup path), `Some(n)`
    /// bounds it (useful in tests).
    pub async fn connect(uri: &str, max_attempts: Option<u32>) -> Result<Self, BrokerError> {
        let mut attempt = 0u32;
        loop {
            match Connection::connect(uri, ConnectionProperties::default()).await {
                Ok(connection) => return Ok(Self { connection }),
                Err(err) => {
                    attempt += 1;
                    if let Some(max) = max_attempts {
                        if attempt >= max {
                            return Err(BrokerError::Amqp(err));
                        }
                    }
                    let delay_ms = crate::backoff::backoff_ms(attempt, 500, 30_000, 0.25);
                    warn!(%err, attempt, delay_ms, "broker connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Declare every exchange, queue, paired retry lane, and DLQ in the
    /// topology. Idempotent: safe to call on every process start.
    pub async fn provision_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        let channel = self.connection.create_channel().await?;

        for exchange in topology.exchanges() {
            channel
                .exchange_declare(
                    exchange.name,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        for queue in topology.queues() {
            channel
                .queue_declare(
                    queue.name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue.name,
                    queue.exchange,
                    queue.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            // Retry lane: TTL queue whose dead-letter exchange routes back
            // to the primary (§4.2's "exponential backoff ladder").
            let retry_name = Topology::retry_queue_name(queue.name);
            let mut retry_args = FieldTable::default();
            retry_args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString("".into()),
            );
            retry_args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(queue.name.into()),
            );
            retry_args.insert(
                "x-message-ttl".into(),
                AMQPValue::LongLongInt(crate::topology::RETRY_TTL_CAP_MS as i64),
            );
            channel
                .queue_declare(
                    &retry_name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    retry_args,
                )
                .await?;

            // Dead-letter queue.
            channel
                .queue_declare(
                    queue.dlq,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue.dlq,
                    "payments.dlx",
                    queue.name,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        info!(
            exchanges = topology.exchanges().len(),
            queues = topology.queues().len(),
            "broker topology provisioned"
        );
        Ok(())
    }

    /// Publish an envelope and wait for the broker's confirmation. Returns
    /// `Ok(true)` only after a positive publisher confirm, per §4.2 ("returns
    /// `true` only after publisher confirmation"); the outbox dispatcher
    /// treats anything else as a retryable failure.
    pub async fn publish(
        &self,
        envelope: &Envelope,
        opts: &PublishOptions,
    ) -> Result<bool, BrokerError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(lapin::options::ConfirmSelectOptions::default())
            .await?;

        let body = serde_json::to_vec(envelope)?;
        let properties = lapin::BasicProperties::default().with_delivery_mode(
            if opts.persistent { 2 } else { 1 },
        );

        let confirm = channel
            .basic_publish(
                &opts.exchange,
                &opts.routing_key,
                BasicPublishOptions {
                    mandatory: opts.mandatory,
                    ..Default::default()
                },
                &body,
                properties,
            )
            .await?
            .await?;

        Ok(confirm.is_ack())
    }

    pub async fn create_channel(&self) -> Result<lapin::Channel, BrokerError> {
        Ok(self.connection.create_channel().await?)
    }
}
