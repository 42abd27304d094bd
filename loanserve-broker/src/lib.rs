//! Broker topology & client (C2, §4.2).
//!
//! Declares the exchange/queue/DLQ/retry topology as a static table (the
//! same declarative-config-table shape `aerugo-SimCash`'s
//! `OrchestratorConfig`/`AgentConfig` use to describe simulation wiring),
//! and wraps `lapin` with the publish-with-confirm and
//! consume-with-ack/nack/retry/DLQ contracts §4.2 specifies.

pub mod backoff;
pub mod client;
pub mod consumer;
pub mod topology;

pub use client::{BrokerClient, BrokerError, PublishOptions};
pub use consumer::{ConsumeOptions, ConsumerHandler};
pub use topology::{Topology, QUEUE_REGISTRY};
