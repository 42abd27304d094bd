//! Webhook ingress adapter (C5, §4.5): signature verification and
//! normalization into an envelope. Grounded on `cowprotocol-services`'s use
//! of `hmac` for inbound signature checks.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use loanserve_core::envelope::{CreateOptions, Envelope, MessageFactory};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const CLOCK_SKEW_SECONDS: i64 = 300;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown provider {0}")]
    UnknownProvider(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("timestamp outside the {CLOCK_SKEW_SECONDS}s clock skew window")]
    StaleTimestamp,
    #[error("malformed signature header")]
    MalformedSignature,
}

pub struct WebhookPayload<'a> {
    pub provider: &'a str,
    pub timestamp: DateTime<Utc>,
    pub raw_body: &'a [u8],
    pub signature_hex: &'a str,
    pub event_type: &'a str,
    pub provider_event_id: &'a str,
    pub data: Value,
}

/// `HMAC-SHA256(secret, timestamp_unix ∥ raw_body)`, constant-time compared
/// against the provided hex signature.
pub fn verify_signature(
    secret: &[u8],
    timestamp: DateTime<Utc>,
    raw_body: &[u8],
    signature_hex: &str,
) -> Result<(), WebhookError> {
    let now = Utc::now();
    if (now - timestamp).num_seconds().abs() > CLOCK_SKEW_SECONDS {
        return Err(WebhookError::StaleTimestamp);
    }

    let expected_bytes =
        hex::decode(signature_hex).map_err(|_| WebhookError::MalformedSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(timestamp.timestamp().to_string().as_bytes());
    mac.update(raw_body);
    let computed = mac.finalize().into_bytes();

    if computed.as_slice().ct_eq(&expected_bytes).into() {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// True for event types this adapter forwards into the payment pipeline;
/// everything else is acknowledged as a no-op (§4.5).
pub fn is_payment_event(event_type: &str) -> bool {
    event_type.starts_with("payment.")
}

/// Build the envelope to publish to `payments.topic` with routing key
/// `payment.webhook.<provider>.<type>`. `idempotency_key` is the provider's
/// own event id, never randomly generated (§4.1).
pub fn to_envelope(factory: &MessageFactory, payload: &WebhookPayload<'_>) -> Envelope {
    let schema = format!("loanserve.payment.webhook.{}.{}", payload.provider, payload.event_type);
    factory.create(
        schema,
        payload.data.clone(),
        CreateOptions {
            idempotency_key: Some(payload.provider_event_id.to_string()),
            ..Default::default()
        },
    )
}

pub fn routing_key(payload: &WebhookPayload<'_>) -> String {
    format!("payment.webhook.{}.{}", payload.provider, payload.event_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], timestamp: DateTime<Utc>, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(timestamp.timestamp().to_string().as_bytes());
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_over_the_exact_body_and_timestamp_is_accepted() {
        let secret = b"webhook-secret";
        let body = br#"{"event":"payment.received"}"#;
        let timestamp = Utc::now();
        let signature = sign(secret, timestamp, body);
        assert!(verify_signature(secret, timestamp, body, &signature).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = b"webhook-secret";
        let timestamp = Utc::now();
        let signature = sign(secret, timestamp, b"original body");
        let result = verify_signature(secret, timestamp, b"tampered body", &signature);
        assert!(matches!(result, Err(WebhookError::InvalidSignature)));
    }

    #[test]
    fn stale_timestamp_outside_the_skew_window_is_rejected() {
        let secret = b"webhook-secret";
        let body = b"payload";
        let stale = Utc::now() - chrono::Duration::seconds(CLOCK_SKEW_SECONDS + 60);
        let signature = sign(secret, stale, body);
        let result = verify_signature(secret, stale, body, &signature);
        assert!(matches!(result, Err(WebhookError::StaleTimestamp)));
    }

    #[test]
    fn malformed_hex_signature_is_rejected_rather_than_panicking() {
        let secret = b"webhook-secret";
        let timestamp = Utc::now();
        let result = verify_signature(secret, timestamp, b"payload", "not-hex!!");
        assert!(matches!(result, Err(WebhookError::MalformedSignature)));
    }

    #[test]
    fn payment_prefixed_event_types_are_forwarded() {
        assert!(is_payment_event("payment.ach.received"));
        assert!(!is_payment_event("notification.send"));
    }

    #[test]
    fn envelope_carries_the_providers_event_id_as_the_idempotency_key() {
        let factory = MessageFactory::new("ingress-webhook");
        let payload = WebhookPayload {
            provider: "dwolla",
            timestamp: Utc::now(),
            raw_body: b"{}",
            signature_hex: "ignored",
            event_type: "transfer_completed",
            provider_event_id: "evt-123",
            data: serde_json::json!({"amount": 100}),
        };
        let envelope = to_envelope(&factory, &payload);
        assert_eq!(envelope.idempotency_key.as_deref(), Some("evt-123"));
        assert_eq!(envelope.schema, "loanserve.payment.webhook.dwolla.transfer_completed");
        assert_eq!(routing_key(&payload), "payment.webhook.dwolla.transfer_completed");
    }
}
