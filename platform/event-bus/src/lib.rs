//! # EventBus Abstraction
//!
//! A platform-level abstraction for event-driven messaging between workflow
//! stages.
//!
//! ## Design
//!
//! Emitters and handlers are decoupled through a per-event-type
//! publish/subscribe contract with at-least-once delivery and an explicit
//! dead-letter queue for messages whose handlers fail. Three interchangeable
//! transports implement the same capability set:
//!
//! - **MemoryBus**: single-process delivery for tests and single-node installs
//! - **RedisBus**: Redis Streams with consumer groups (requires Redis >= 7.0)
//! - **KafkaBus**: one reader per event type against a shared consumer group
//!
//! Events are carried in an [`Envelope`] (`{"type": ..., "payload": ...}`).
//! Decoding goes through an [`EventRegistry`] that is built by the domain
//! crate and passed to every bus constructor, so multiple isolated buses can
//! coexist in one process.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, MemoryBus};
//! # use std::sync::Arc;
//! # async fn example<E: event_bus::BusEvent>(event: E, handler: Arc<dyn event_bus::EventHandler<E>>) -> event_bus::BusResult<()> {
//! let bus = MemoryBus::<E>::new();
//! bus.register("deposit.requested", handler).await?;
//! bus.emit(&event).await?;
//! bus.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod dlq;
mod envelope;
mod kafka_bus;
mod memory_bus;
mod redis_bus;
mod registry;

pub use config::DlqConfig;
pub use dlq::backoff_delay;
pub use envelope::{Envelope, EnvelopeError};
pub use kafka_bus::{KafkaBus, KafkaConfig};
pub use memory_bus::MemoryBus;
pub use redis_bus::RedisBus;
pub use registry::{DecodeError, EventRegistry};

use async_trait::async_trait;
use std::sync::Arc;

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),

    #[error("invalid bus configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Encode(#[from] EnvelopeError),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to register handler for {event_type}: {reason}")]
    Register { event_type: String, reason: String },

    #[error("event bus is closed")]
    Closed,
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Transient failure returned by a handler.
///
/// A handler returns `Err(HandlerError)` **only** for transient
/// infrastructure failures (broker unavailable, database deadlock, provider
/// 5xx/timeout); the message is then routed to the DLQ and retried with
/// backoff. Business failures are reported by emitting the flow's `*Failed`
/// event and returning `Ok(())` so the broker offset advances.
#[derive(Debug, thiserror::Error)]
#[error("transient handler failure: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// The event family a bus instance transports.
///
/// Implemented by the domain's tagged event enum: the `type` field of the
/// envelope is the tag, and the payload is the serialized variant.
pub trait BusEvent: Clone + Send + Sync + 'static {
    /// The `flow.step` event-type string, e.g. `deposit.requested`
    fn event_type(&self) -> &'static str;

    /// The event-specific payload carried inside the envelope
    fn payload(&self) -> Result<serde_json::Value, serde_json::Error>;
}

/// A callable bound to one event type.
///
/// Handlers within a single message are invoked in parallel; the message is
/// considered handled only if **all** of them return `Ok`.
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(&self, event: E) -> Result<(), HandlerError>;
}

/// Core event bus abstraction.
///
/// All three transports satisfy this interface. Registration after startup
/// is allowed; Redis and Kafka lazily create consumer groups and spawn the
/// consumer worker for newly registered event types.
#[async_trait]
pub trait EventBus<E: BusEvent>: Send + Sync {
    /// Subscribe a handler to an event type.
    ///
    /// Multiple handlers for one type are all invoked per message, in
    /// parallel, with a barrier that waits for every handler before the
    /// ack/commit decision.
    async fn register(&self, event_type: &str, handler: Arc<dyn EventHandler<E>>) -> BusResult<()>;

    /// Publish an event.
    ///
    /// Fails with [`BusError::Unavailable`] when the underlying transport is
    /// not ready and with [`BusError::Encode`] when the envelope cannot be
    /// marshaled.
    async fn emit(&self, event: &E) -> BusResult<()>;

    /// Stop consumer workers and the DLQ retry worker, waiting for in-flight
    /// handlers to finish.
    async fn close(&self) -> BusResult<()>;
}

impl<E: BusEvent> std::fmt::Debug for dyn EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventBus")
    }
}

/// Split a `flow.step` event type into its flow and step parts.
///
/// Stream, topic, group, and consumer names are all derived from this split:
/// `events:<flow>:<step>` on Redis, `<prefix>.<flow>.<step>` on Kafka.
pub fn flow_step(event_type: &str) -> (&str, &str) {
    event_type.split_once('.').unwrap_or((event_type, "event"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_step_splits_on_first_dot() {
        assert_eq!(flow_step("deposit.requested"), ("deposit", "requested"));
        assert_eq!(flow_step("transfer.domain_done"), ("transfer", "domain_done"));
        assert_eq!(flow_step("payment.initiation"), ("payment", "initiation"));
    }

    #[test]
    fn flow_step_tolerates_single_part_types() {
        assert_eq!(flow_step("heartbeat"), ("heartbeat", "event"));
    }
}
