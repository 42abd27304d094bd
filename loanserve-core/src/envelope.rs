//! Message envelope & factory (C1)
//!
//! Canonical event shape shared by every broker message in the system, plus
//! the factory that stamps identity and correlation metadata the same way
//! every time. Idempotency keys are business-meaningful values supplied by
//! the caller (e.g. an ACH trace number + date + amount) — this module never
//! invents one.
//!
//! # Example
//!
//! ```
//! use loanserve_core::envelope::MessageFactory;
//! use serde_json::json;
//!
//! let factory = MessageFactory::new("validation-consumer@1.4.0");
//! let parent = factory.create("loanserve.payment.v1.received", json!({"amount_cents": 35000}), Default::default());
//! let child = factory.reply(&parent, "loanserve.payment.v1.validated", json!({"ok": true}));
//!
//! assert_eq!(child.correlation_id, parent.correlation_id);
//! assert_eq!(child.causation_id, Some(parent.message_id));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use ulid::Ulid;
use uuid::Uuid;

/// Envelope protocol version. Bumped only on a breaking wire-format change.
pub const ENVELOPE_VERSION: u32 = 1;

/// Canonical broker message shape (§3 Envelope, §6.2 wire format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: String,
    pub message_id: Ulid,
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub producer: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    pub retry_count: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub data: Value,
}

impl Envelope {
    /// Validates §3's invariant that `priority` (if present) is 0–9.
    pub fn is_well_formed(&self) -> bool {
        self.priority.map(|p| p <= 9).unwrap_or(true) && self.version == ENVELOPE_VERSION
    }
}

/// Options accepted by [`MessageFactory::create`] and [`MessageFactory::batch`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub correlation_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub priority: Option<u8>,
    pub ttl: Option<u64>,
    pub headers: HashMap<String, String>,
}

/// Stamps envelopes with fresh identity/correlation metadata.
///
/// One factory per producing service, constructed once at process start
/// (see the design note on replacing global state with explicit
/// singletons).
#[derive(Debug, Clone)]
pub struct MessageFactory {
    producer: String,
}

impl MessageFactory {
    pub fn new(producer: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
        }
    }

    /// Produce a fresh envelope. If `opts.correlation_id` is `None`, a new
    /// correlation id is minted (this envelope becomes the root of its
    /// correlation chain).
    pub fn create(&self, schema: impl Into<String>, data: Value, opts: CreateOptions) -> Envelope {
        Envelope {
            schema: schema.into(),
            message_id: Ulid::new(),
            correlation_id: opts.correlation_id.unwrap_or_else(Uuid::new_v4),
            causation_id: None,
            idempotency_key: opts.idempotency_key,
            occurred_at: Utc::now(),
            producer: self.producer.clone(),
            version: ENVELOPE_VERSION,
            trace_id: opts.trace_id,
            tenant_id: opts.tenant_id,
            priority: opts.priority,
            ttl: opts.ttl,
            retry_count: 0,
            headers: opts.headers,
            data,
        }
    }

    /// Produce a child envelope: inherits `correlation_id` from `parent`,
    /// sets `causation_id = parent.message_id`. No idempotency key is
    /// inherited — callers that need one must compute a fresh business key
    /// for the child's own semantics.
    pub fn reply(&self, parent: &Envelope, schema: impl Into<String>, data: Value) -> Envelope {
        Envelope {
            schema: schema.into(),
            message_id: Ulid::new(),
            correlation_id: parent.correlation_id,
            causation_id: Some(parent.message_id),
            idempotency_key: None,
            occurred_at: Utc::now(),
            producer: self.producer.clone(),
            version: ENVELOPE_VERSION,
            trace_id: parent.trace_id,
            tenant_id: parent.tenant_id,
            priority: parent.priority,
            ttl: parent.ttl,
            retry_count: 0,
            headers: HashMap::new(),
            data,
        }
    }

    /// Produce a batch of envelopes that all share one fresh
    /// `correlation_id`, useful for fan-out publications (e.g. one
    /// `distribution.calculated` envelope per investor).
    pub fn batch(
        &self,
        schema: impl Into<String>,
        items: Vec<Value>,
        opts: CreateOptions,
    ) -> Vec<Envelope> {
        let schema = schema.into();
        let correlation_id = opts.correlation_id.unwrap_or_else(Uuid::new_v4);
        items
            .into_iter()
            .map(|data| {
                self.create(
                    schema.clone(),
                    data,
                    CreateOptions {
                        correlation_id: Some(correlation_id),
                        idempotency_key: None,
                        trace_id: opts.trace_id,
                        tenant_id: opts.tenant_id,
                        priority: opts.priority,
                        ttl: opts.ttl,
                        headers: opts.headers.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_mints_fresh_correlation_id_when_none_given() {
        let factory = MessageFactory::new("svc@1.0.0");
        let a = factory.create("schema.a", json!({}), CreateOptions::default());
        let b = factory.create("schema.a", json!({}), CreateOptions::default());
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn reply_inherits_correlation_and_sets_causation() {
        let factory = MessageFactory::new("svc@1.0.0");
        let parent = factory.create("schema.a", json!({}), CreateOptions::default());
        let child = factory.reply(&parent, "schema.b", json!({}));
        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.causation_id, Some(parent.message_id));
    }

    #[test]
    fn batch_shares_one_correlation_id() {
        let factory = MessageFactory::new("svc@1.0.0");
        let items = vec![json!({"i": 0}), json!({"i": 1}), json!({"i": 2})];
        let envelopes = factory.batch("schema.c", items, CreateOptions::default());
        let first_corr = envelopes[0].correlation_id;
        assert!(envelopes.iter().all(|e| e.correlation_id == first_corr));
        let ids: std::collections::HashSet<_> = envelopes.iter().map(|e| e.message_id).collect();
        assert_eq!(ids.len(), envelopes.len());
    }

    #[test]
    fn well_formed_rejects_out_of_range_priority() {
        let factory = MessageFactory::new("svc@1.0.0");
        let mut env = factory.create(
            "schema.a",
            json!({}),
            CreateOptions {
                priority: Some(9),
                ..Default::default()
            },
        );
        assert!(env.is_well_formed());
        env.priority = Some(10);
        assert!(!env.is_well_formed());
    }
}
