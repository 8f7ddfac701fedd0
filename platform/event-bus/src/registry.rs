//! # Event-Type Registry
//!
//! Explicit mapping `event-type string -> decoder closure` that consumers
//! use to turn an envelope payload back into a domain event.
//!
//! The registry is an owned object passed to every bus constructor, so
//! multiple isolated buses can run in one process (useful for tests) and
//! there are no hidden init-order dependencies. Registration must happen
//! before consumers attach; a lookup failure marks the message as malformed
//! and it is dead-lettered or dropped by the transport.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors produced while decoding an envelope payload into a domain event
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("failed to decode {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

type Decoder<E> = Arc<dyn Fn(serde_json::Value) -> Result<E, DecodeError> + Send + Sync>;

/// Registry of event-type decoders for one event family
#[derive(Clone)]
pub struct EventRegistry<E> {
    decoders: HashMap<String, Decoder<E>>,
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register a decoder closure for an event type.
    ///
    /// Registering the same type twice replaces the previous decoder.
    pub fn register<F>(&mut self, event_type: &str, decoder: F)
    where
        F: Fn(serde_json::Value) -> Result<E, DecodeError> + Send + Sync + 'static,
    {
        self.decoders.insert(event_type.to_string(), Arc::new(decoder));
    }

    /// Register an event type whose payload deserializes into `T`, wrapped
    /// into the family type by `wrap` (typically an enum variant constructor).
    pub fn register_as<T, W>(&mut self, event_type: &'static str, wrap: W)
    where
        T: DeserializeOwned,
        W: Fn(T) -> E + Send + Sync + 'static,
    {
        self.register(event_type, move |payload| {
            serde_json::from_value::<T>(payload)
                .map(&wrap)
                .map_err(|source| DecodeError::Payload {
                    event_type: event_type.to_string(),
                    source,
                })
        });
    }

    /// Decode a payload under the given event type
    pub fn decode(&self, event_type: &str, payload: serde_json::Value) -> Result<E, DecodeError> {
        let decoder = self
            .decoders
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownType(event_type.to_string()))?;
        decoder(payload)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// All registered event types, in no particular order
    pub fn known_types(&self) -> Vec<String> {
        self.decoders.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Ping {
        seq: u64,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Ping(Ping),
    }

    #[test]
    fn decodes_registered_type() {
        let mut registry = EventRegistry::new();
        registry.register_as("test.ping", TestEvent::Ping);

        let event = registry
            .decode("test.ping", serde_json::json!({"seq": 7}))
            .unwrap();

        assert_eq!(event, TestEvent::Ping(Ping { seq: 7 }));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry: EventRegistry<TestEvent> = EventRegistry::new();

        assert!(matches!(
            registry.decode("test.pong", serde_json::Value::Null),
            Err(DecodeError::UnknownType(t)) if t == "test.pong"
        ));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut registry = EventRegistry::new();
        registry.register_as("test.ping", TestEvent::Ping);

        assert!(matches!(
            registry.decode("test.ping", serde_json::json!({"seq": "not-a-number"})),
            Err(DecodeError::Payload { event_type, .. }) if event_type == "test.ping"
        ));
    }

    #[test]
    fn known_types_reports_registrations() {
        let mut registry = EventRegistry::new();
        registry.register_as("test.ping", TestEvent::Ping);

        assert!(registry.contains("test.ping"));
        assert_eq!(registry.known_types(), vec!["test.ping".to_string()]);
    }
}
