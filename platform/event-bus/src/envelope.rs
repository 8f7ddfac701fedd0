//! # Event Envelope
//!
//! Wire wrapper for every message that crosses a broker:
//!
//! ```json
//! { "type": "<event-type>", "payload": { ... } }
//! ```
//!
//! The `type` field is the tag consumers use to look up a decoder in the
//! [`EventRegistry`](crate::EventRegistry); `payload` is the event-specific
//! JSON. On Redis the encoded envelope is stored as the single stream field
//! `event`; on Kafka it is the message value (keyed by the event type).

use serde::{Deserialize, Serialize};

use crate::BusEvent;

/// Errors produced while marshaling an envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Generic wrapper that lets heterogeneous events share one transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap an event into its wire envelope
    pub fn from_event<E: BusEvent>(event: &E) -> Result<Self, EnvelopeError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            payload: event.payload().map_err(EnvelopeError::Encode)?,
        })
    }

    /// Serialize to the on-broker byte representation
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Parse an envelope from broker bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_uses_type_and_payload_keys() {
        let envelope = Envelope {
            event_type: "deposit.requested".to_string(),
            payload: json!({"amount": 100}),
        };

        let bytes = envelope.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], "deposit.requested");
        assert_eq!(value["payload"]["amount"], 100);
    }

    #[test]
    fn decode_round_trips_encode() {
        let envelope = Envelope {
            event_type: "transfer.completed".to_string(),
            payload: json!({"correlation_id": "abc", "amount": {"minor": 3000, "currency": "USD"}}),
        };

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded.event_type, envelope.event_type);
        assert_eq!(decoded.payload, envelope.payload);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(b"not-json"),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_type() {
        let bytes = serde_json::to_vec(&json!({"payload": {}})).unwrap();
        assert!(Envelope::decode(&bytes).is_err());
    }
}
