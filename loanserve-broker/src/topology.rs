//! Static exchange/queue/retry-ladder topology (§4.2).

/// A durable topic exchange declaration.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeDecl {
    pub name: &'static str,
    pub kind: &'static str,
}

/// A durable queue plus its paired `*.retry` lane and DLQ, per §4.2's
/// "each queue has a paired `*.retry` queue with `x-message-ttl` and
/// `x-dead-letter-exchange` pointing back at the primary" design.
#[derive(Debug, Clone, Copy)]
pub struct QueueDecl {
    pub name: &'static str,
    pub exchange: &'static str,
    pub routing_key: &'static str,
    pub prefetch: u16,
    pub dlq: &'static str,
}

pub const EXCHANGES: &[ExchangeDecl] = &[
    ExchangeDecl { name: "payments.topic", kind: "topic" },
    ExchangeDecl { name: "payments.saga", kind: "topic" },
    ExchangeDecl { name: "notifications.topic", kind: "topic" },
    ExchangeDecl { name: "crm.email.topic", kind: "topic" },
    ExchangeDecl { name: "events.topic", kind: "topic" },
    ExchangeDecl { name: "payments.dlx", kind: "topic" },
    ExchangeDecl { name: "crm.email.dlx", kind: "topic" },
];

/// Queue registry. `prefetch` values match §5's per-consumer table
/// (validation=10, classification=25, allocation=10, distribution=10,
/// reversal=5, email=5).
pub const QUEUE_REGISTRY: &[QueueDecl] = &[
    QueueDecl {
        name: "payments.validation",
        exchange: "payments.topic",
        routing_key: "payment.*.received",
        prefetch: 10,
        dlq: "payments.validation.dlq",
    },
    QueueDecl {
        name: "payments.classification",
        exchange: "payments.topic",
        routing_key: "payment.*.validated",
        prefetch: 25,
        dlq: "payments.classification.dlq",
    },
    QueueDecl {
        name: "payments.distribution",
        exchange: "payments.topic",
        routing_key: "payment.*.posted",
        prefetch: 10,
        dlq: "payments.distribution.dlq",
    },
    QueueDecl {
        name: "payments.allocation",
        exchange: "payments.saga",
        routing_key: "saga.payment.start",
        prefetch: 10,
        dlq: "payments.allocation.dlq",
    },
    QueueDecl {
        name: "payments.reversal",
        exchange: "payments.saga",
        routing_key: "saga.payment.reversal.*",
        prefetch: 5,
        dlq: "payments.reversal.dlq",
    },
    QueueDecl {
        name: "payments.returned",
        exchange: "payments.topic",
        routing_key: "return.*",
        prefetch: 10,
        dlq: "payments.returned.dlq",
    },
    QueueDecl {
        name: "investor.clawback",
        exchange: "events.topic",
        routing_key: "distribution.clawback",
        prefetch: 10,
        dlq: "investor.clawback.dlq",
    },
    QueueDecl {
        name: "q.crm.email.v1",
        exchange: "crm.email.topic",
        routing_key: "notification.send",
        prefetch: 5,
        dlq: "q.crm.email.v1.dlq",
    },
];

/// Retry ladder cap, per §4.2: "exponential backoff ladder (cap 5 minutes,
/// jitter +/-25%)".
pub const RETRY_TTL_CAP_MS: u64 = 5 * 60 * 1000;

/// Full declarative topology a [`crate::client::BrokerClient`] provisions
/// on startup: exchanges, queues (each paired with a `*.retry` and a DLQ).
#[derive(Debug, Clone, Copy, Default)]
pub struct Topology;

impl Topology {
    pub fn exchanges(&self) -> &'static [ExchangeDecl] {
        EXCHANGES
    }

    pub fn queues(&self) -> &'static [QueueDecl] {
        QUEUE_REGISTRY
    }

    /// Retry queue name for a primary queue, e.g. `payments.validation.retry`.
    pub fn retry_queue_name(queue: &str) -> String {
        format!("{queue}.retry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_queue_has_a_distinct_dlq() {
        let dlqs: std::collections::HashSet<_> =
            QUEUE_REGISTRY.iter().map(|q| q.dlq).collect();
        assert_eq!(dlqs.len(), QUEUE_REGISTRY.len());
    }

    #[test]
    fn retry_queue_name_is_suffixed() {
        assert_eq!(
            Topology::retry_queue_name("payments.validation"),
            "payments.validation.retry"
        );
    }

    #[test]
    fn prefetch_matches_concurrency_table() {
        let get = |name: &str| {
            QUEUE_REGISTRY
                .iter()
                .find(|q| q.name == name)
                .unwrap()
                .prefetch
        };
        assert_eq!(get("payments.validation"), 10);
        assert_eq!(get("payments.classification"), 25);
        assert_eq!(get("payments.distribution"), 10);
        assert_eq!(get("payments.reversal"), 5);
        assert_eq!(get("q.crm.email.v1"), 5);
    }
}
