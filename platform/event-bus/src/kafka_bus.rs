//! Kafka implementation of the EventBus trait.
//!
//! One `StreamConsumer` per registered event type, all under the shared
//! group id. For event type `flow.step` the main topic is
//! `<prefix>.flow.step` and the dead-letter topic `<prefix>.dlq.flow.step`;
//! the message key is the event type string. Topics are auto-created with
//! the broker defaults (one partition, replication factor 1), which is what
//! preserves per-event-type FIFO ordering.
//!
//! Commit rules:
//! - malformed input (undecodable envelope, unknown type, no handler) is
//!   committed and dropped; the retry worker is not the right recipient
//! - all handlers succeeded: commit
//! - a handler failed: publish the original value to the DLQ topic; commit
//!   only if that publish succeeded, otherwise sleep 500 ms and let the
//!   message be redelivered

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::dlq::{parse_retry_count, DlqWorker};
use crate::{
    backoff_delay, BusError, BusEvent, BusResult, DlqConfig, Envelope, EventBus, EventHandler,
    EventRegistry,
};

/// Initial dial timeout
const DIAL_TIMEOUT_MS: &str = "5000";
/// Wait after a failed DLQ publish before the message is polled again
const DLQ_PUBLISH_BACKOFF: Duration = Duration::from_millis(500);
/// Per-poll wait while draining a DLQ batch
const DLQ_POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound on one DLQ batch, across polls
const DLQ_BATCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Publish acknowledgement timeout
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the Kafka transport
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` broker list
    pub brokers: String,
    /// Topic namespace, e.g. `fintech.events`
    pub topic_prefix: String,
    /// Shared consumer group id; the DLQ retry worker uses `<group>-dlq-retry`
    pub group_id: String,
    pub tls_enabled: bool,
    pub tls_ca: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub dlq: DlqConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic_prefix: "fintech.events".to_string(),
            group_id: "fintech".to_string(),
            tls_enabled: false,
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
            sasl_username: None,
            sasl_password: None,
            dlq: DlqConfig::default(),
        }
    }
}

impl KafkaConfig {
    fn validate(&self) -> BusResult<()> {
        if self.brokers.trim().is_empty() {
            return Err(BusError::Config("kafka broker list is empty".to_string()));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(BusError::Config(
                "kafka tls certificate and key must be provided together".to_string(),
            ));
        }
        if self.sasl_username.is_some() != self.sasl_password.is_some() {
            return Err(BusError::Config(
                "kafka sasl username and password must be provided together".to_string(),
            ));
        }
        Ok(())
    }

    fn security_protocol(&self) -> &'static str {
        match (self.tls_enabled, self.sasl_username.is_some()) {
            (true, true) => "SASL_SSL",
            (true, false) => "SSL",
            (false, true) => "SASL_PLAINTEXT",
            (false, false) => "PLAINTEXT",
        }
    }

    fn base_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("socket.connection.setup.timeout.ms", DIAL_TIMEOUT_MS)
            .set("security.protocol", self.security_protocol());

        if let Some(ca) = &self.tls_ca {
            config.set("ssl.ca.location", ca);
        }
        if let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) {
            config.set("ssl.certificate.location", cert);
            config.set("ssl.key.location", key);
        }
        if let (Some(user), Some(pass)) = (&self.sasl_username, &self.sasl_password) {
            config
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", user)
                .set("sasl.password", pass);
        }

        config
    }

    fn dlq_retry_group(&self) -> String {
        format!("{}-dlq-retry", self.group_id)
    }
}

pub fn topic_name(prefix: &str, event_type: &str) -> String {
    format!("{prefix}.{event_type}")
}

pub fn dlq_topic_name(prefix: &str, event_type: &str) -> String {
    format!("{prefix}.dlq.{event_type}")
}

type HandlerMap<E> = RwLock<HashMap<String, Vec<Arc<dyn EventHandler<E>>>>>;

struct KafkaInner<E: BusEvent> {
    producer: FutureProducer,
    config: KafkaConfig,
    registry: EventRegistry<E>,
    handlers: HandlerMap<E>,
    consuming: RwLock<HashSet<String>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

pub struct KafkaBus<E: BusEvent> {
    inner: Arc<KafkaInner<E>>,
    worker: DlqWorker,
}

impl<E: BusEvent> KafkaBus<E> {
    /// Build a bus against the given broker list.
    ///
    /// Fails with [`BusError::Config`] for inconsistent TLS/SASL material or
    /// an empty broker list; the bus refuses to start in that case.
    pub fn new(config: KafkaConfig, registry: EventRegistry<E>) -> BusResult<Self> {
        config.validate()?;

        let producer: FutureProducer = config
            .base_client_config()
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BusError::Unavailable(format!("kafka producer init failed: {e}")))?;

        Ok(Self {
            inner: Arc::new(KafkaInner {
                producer,
                config,
                registry,
                handlers: RwLock::new(HashMap::new()),
                consuming: RwLock::new(HashSet::new()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            worker: DlqWorker::new(),
        })
    }

    /// Start the background DLQ retry worker. Idempotent while running.
    pub fn start_dlq_worker(&self) {
        let inner = self.inner.clone();
        self.worker.start(async move {
            let mut consumers: HashMap<String, StreamConsumer> = HashMap::new();
            let mut ticker = tokio::time::interval(inner.config.dlq.retry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for event_type in inner.registry.known_types() {
                            if inner.cancel.is_cancelled() {
                                break;
                            }
                            if let Err(e) = inner.sweep_dlq(&mut consumers, &event_type).await {
                                warn!(event_type = %event_type, error = %e, "dlq sweep failed");
                            }
                        }
                    }
                }
            }
            info!("kafka dlq worker stopped");
        });
    }
}

#[async_trait]
impl<E: BusEvent> EventBus<E> for KafkaBus<E> {
    async fn register(&self, event_type: &str, handler: Arc<dyn EventHandler<E>>) -> BusResult<()> {
        {
            let mut guard = self.inner.handlers.write().await;
            guard.entry(event_type.to_string()).or_default().push(handler);
        }

        let newly_consuming = {
            let mut guard = self.inner.consuming.write().await;
            guard.insert(event_type.to_string())
        };
        if !newly_consuming {
            return Ok(());
        }

        let topic = topic_name(&self.inner.config.topic_prefix, event_type);
        let consumer = self
            .inner
            .new_consumer(&self.inner.config.group_id, &topic)
            .map_err(|e| BusError::Register {
                event_type: event_type.to_string(),
                reason: e.to_string(),
            })?;

        let inner = self.inner.clone();
        let event_type = event_type.to_string();
        self.inner.tracker.spawn(async move {
            inner.consume_loop(consumer, event_type).await;
        });

        Ok(())
    }

    async fn emit(&self, event: &E) -> BusResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let envelope = Envelope::from_event(event)?;
        let payload = envelope.encode()?;
        let topic = topic_name(&self.inner.config.topic_prefix, event.event_type());
        let key = event.event_type();

        let record = FutureRecord::to(&topic).key(key).payload(&payload);
        self.inner
            .producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map_err(|(e, _)| BusError::Publish(format!("produce to {topic} failed: {e}")))?;

        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.worker.stop().await;
        Ok(())
    }
}

impl<E: BusEvent> KafkaInner<E> {
    fn new_consumer(&self, group_id: &str, topic: &str) -> Result<StreamConsumer, KafkaError> {
        let consumer: StreamConsumer = self
            .config
            .base_client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("allow.auto.create.topics", "true")
            .set("session.timeout.ms", "30000")
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(consumer)
    }

    async fn consume_loop(self: Arc<Self>, consumer: StreamConsumer, event_type: String) {
        let topic = topic_name(&self.config.topic_prefix, &event_type);
        info!(topic = %topic, group = %self.config.group_id, "consumer started");

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = consumer.recv() => received,
            };

            match received {
                Ok(message) => {
                    self.process_message(&consumer, &message, &event_type).await;
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "kafka read failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(topic = %topic, "consumer stopped");
    }

    async fn process_message(
        &self,
        consumer: &StreamConsumer,
        message: &BorrowedMessage<'_>,
        expected_type: &str,
    ) {
        let topic = message.topic().to_string();

        let Some(payload) = message.payload() else {
            warn!(topic = %topic, offset = message.offset(), "empty message, committing and dropping");
            self.commit(consumer, message);
            return;
        };

        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %topic, offset = message.offset(), error = %e, "undecodable envelope, committing and dropping");
                self.commit(consumer, message);
                return;
            }
        };

        // A mismatched type still processes under its envelope-declared type
        if envelope.event_type != expected_type {
            warn!(
                topic = %topic,
                declared = %envelope.event_type,
                expected = %expected_type,
                "envelope type does not match topic"
            );
        }

        let event = match self.registry.decode(&envelope.event_type, envelope.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %topic, offset = message.offset(), error = %e, "unknown or malformed event, committing and dropping");
                self.commit(consumer, message);
                return;
            }
        };

        let snapshot = {
            let guard = self.handlers.read().await;
            guard.get(&envelope.event_type).cloned().unwrap_or_default()
        };
        if snapshot.is_empty() {
            warn!(topic = %topic, event_type = %envelope.event_type, "no handler registered, committing and dropping");
            self.commit(consumer, message);
            return;
        }

        let results = join_all(snapshot.iter().map(|h| h.handle(event.clone()))).await;
        let failed = results.iter().filter_map(|r| r.as_ref().err()).count();

        if failed == 0 {
            self.commit(consumer, message);
            return;
        }

        warn!(
            topic = %topic,
            offset = message.offset(),
            event_type = %envelope.event_type,
            failed_handlers = failed,
            "handler failure, routing message to dlq topic"
        );

        match self.publish_to_dlq(message, &envelope.event_type, payload).await {
            Ok(()) => self.commit(consumer, message),
            Err(e) => {
                // Leaving the offset uncommitted makes the broker redeliver
                error!(topic = %topic, offset = message.offset(), error = %e, "dlq publish failed");
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(DLQ_PUBLISH_BACKOFF) => {}
                }
            }
        }
    }

    async fn publish_to_dlq(
        &self,
        message: &BorrowedMessage<'_>,
        event_type: &str,
        payload: &[u8],
    ) -> Result<(), KafkaError> {
        let dlq_topic = dlq_topic_name(&self.config.topic_prefix, event_type);

        let mut headers = OwnedHeaders::new();
        if let Some(original) = message.headers() {
            for header in original.iter() {
                headers = headers.insert(header);
            }
        }
        let origin = format!("{}/{}", message.partition(), message.offset());
        let failed_at = Utc::now().to_rfc3339();
        headers = headers
            .insert(Header {
                key: "original_id",
                value: Some(origin.as_bytes()),
            })
            .insert(Header {
                key: "failed_at",
                value: Some(failed_at.as_bytes()),
            });

        let record = FutureRecord::to(&dlq_topic)
            .key(event_type)
            .payload(payload)
            .headers(headers);

        self.producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| e)
    }

    /// One DLQ sweep for one event type via the dedicated retry group.
    async fn sweep_dlq(
        &self,
        consumers: &mut HashMap<String, StreamConsumer>,
        event_type: &str,
    ) -> Result<(), KafkaError> {
        let dlq_topic = dlq_topic_name(&self.config.topic_prefix, event_type);

        if !consumers.contains_key(event_type) {
            let consumer = self.new_consumer(&self.config.dlq_retry_group(), &dlq_topic)?;
            consumers.insert(event_type.to_string(), consumer);
        }
        let Some(consumer) = consumers.get(event_type) else {
            return Ok(());
        };

        let deadline = tokio::time::Instant::now() + DLQ_BATCH_TIMEOUT;
        let mut handled = 0usize;

        while handled < self.config.dlq.batch_size && tokio::time::Instant::now() < deadline {
            let message = match tokio::time::timeout(DLQ_POLL_TIMEOUT, consumer.recv()).await {
                // Poll window elapsed: the queue is drained (or empty)
                Err(_) => break,
                Ok(Err(e)) => return Err(e),
                Ok(Ok(message)) => message,
            };
            handled += 1;

            let retry_count = parse_retry_count(
                header_value(&message, "retry_count")
                    .and_then(|v| std::str::from_utf8(v).ok())
                    .map(str::trim)
                    .filter(|s| !s.is_empty()),
            );

            if retry_count >= self.config.dlq.max_retries {
                warn!(
                    dlq_topic = %dlq_topic,
                    partition = message.partition(),
                    offset = message.offset(),
                    retry_count,
                    "retries exhausted, dropping dead-lettered message"
                );
                self.commit(consumer, &message);
                continue;
            }

            let Some(payload) = message.payload().map(<[u8]>::to_vec) else {
                warn!(dlq_topic = %dlq_topic, offset = message.offset(), "dead-lettered message has no payload, dropping");
                self.commit(consumer, &message);
                continue;
            };

            let delay = backoff_delay(&self.config.dlq, retry_count);
            debug!(dlq_topic = %dlq_topic, offset = message.offset(), retry_count, delay_secs = delay.as_secs(), "retrying dead-lettered message");
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            let original_topic = topic_name(&self.config.topic_prefix, event_type);
            let next_count = (retry_count + 1).to_string();
            let headers = OwnedHeaders::new().insert(Header {
                key: "retry_count",
                value: Some(next_count.as_bytes()),
            });
            let record = FutureRecord::to(&original_topic)
                .key(event_type)
                .payload(&payload)
                .headers(headers);

            match self.producer.send(record, PUBLISH_TIMEOUT).await {
                Ok(_) => self.commit(consumer, &message),
                Err((e, _)) => {
                    warn!(dlq_topic = %dlq_topic, offset = message.offset(), error = %e, "republish failed, keeping dead-lettered message");
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn commit(&self, consumer: &StreamConsumer, message: &BorrowedMessage<'_>) {
        if let Err(e) = consumer.commit_message(message, CommitMode::Async) {
            error!(topic = message.topic(), offset = message.offset(), error = %e, "offset commit failed");
        }
    }
}

fn header_value<'a>(message: &'a BorrowedMessage<'_>, key: &str) -> Option<&'a [u8]> {
    message
        .headers()
        .and_then(|headers| headers.iter().find(|h| h.key == key))
        .and_then(|h| h.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_are_prefixed() {
        assert_eq!(
            topic_name("fintech.events", "deposit.requested"),
            "fintech.events.deposit.requested"
        );
        assert_eq!(
            dlq_topic_name("fintech.events", "deposit.requested"),
            "fintech.events.dlq.deposit.requested"
        );
    }

    #[test]
    fn security_protocol_reflects_tls_and_sasl() {
        let mut config = KafkaConfig::default();
        assert_eq!(config.security_protocol(), "PLAINTEXT");

        config.tls_enabled = true;
        assert_eq!(config.security_protocol(), "SSL");

        config.sasl_username = Some("svc".to_string());
        config.sasl_password = Some("secret".to_string());
        assert_eq!(config.security_protocol(), "SASL_SSL");

        config.tls_enabled = false;
        assert_eq!(config.security_protocol(), "SASL_PLAINTEXT");
    }

    #[test]
    fn validate_rejects_partial_tls_material() {
        let config = KafkaConfig {
            tls_enabled: true,
            tls_cert: Some("/etc/kafka/client.pem".to_string()),
            ..KafkaConfig::default()
        };

        assert!(matches!(config.validate(), Err(BusError::Config(_))));
    }

    #[test]
    fn validate_rejects_partial_sasl_credentials() {
        let config = KafkaConfig {
            sasl_username: Some("svc".to_string()),
            ..KafkaConfig::default()
        };

        assert!(matches!(config.validate(), Err(BusError::Config(_))));
    }

    #[test]
    fn validate_rejects_empty_broker_list() {
        let config = KafkaConfig {
            brokers: "  ".to_string(),
            ..KafkaConfig::default()
        };

        assert!(matches!(config.validate(), Err(BusError::Config(_))));
    }

    #[test]
    fn dlq_retry_group_derives_from_group_id() {
        let config = KafkaConfig::default();
        assert_eq!(config.dlq_retry_group(), "fintech-dlq-retry");
    }
}
