//! Redis Streams implementation of the EventBus trait.
//!
//! Requires Redis >= 7.0. Per event type `flow.step`:
//!
//! - main stream `events:<flow>:<step>`, consumer group `group:<flow>:<step>`,
//!   consumer `consumer:<flow>:<step>`
//! - dead-letter stream `dlq:<flow>:<step>` swept by the retry worker under
//!   group `group:dlq:<flow>:<step>`
//!
//! Delivery is at-least-once: a message is acknowledged iff every handler
//! succeeded, or its copy was durably written to the DLQ stream. When the
//! DLQ write itself fails the entry stays pending and is redelivered.
//!
//! Each consumer loop and the DLQ worker hold their own connection so that
//! blocking group reads never stall publishes on the shared connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::dlq::{parse_retry_count, DlqWorker};
use crate::{
    backoff_delay, flow_step, BusError, BusEvent, BusResult, DlqConfig, Envelope, EventBus,
    EventHandler, EventRegistry,
};

/// Stale consumers with entries pending longer than this are reaped on
/// registration
const STALE_PENDING_MS: u64 = 5 * 60 * 1000;
/// Blocking group-read window
const READ_BLOCK_MS: u64 = 5_000;
/// Messages per group read
const READ_COUNT: usize = 10;
/// Pause after a failed read before retrying
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Consumer name used by the DLQ retry worker
const DLQ_CONSUMER: &str = "consumer:dlq-retry";

pub fn stream_name(event_type: &str) -> String {
    let (flow, step) = flow_step(event_type);
    format!("events:{flow}:{step}")
}

pub fn dlq_stream_name(event_type: &str) -> String {
    let (flow, step) = flow_step(event_type);
    format!("dlq:{flow}:{step}")
}

fn group_name(event_type: &str) -> String {
    let (flow, step) = flow_step(event_type);
    format!("group:{flow}:{step}")
}

fn consumer_name(event_type: &str) -> String {
    let (flow, step) = flow_step(event_type);
    format!("consumer:{flow}:{step}")
}

fn dlq_group_name(event_type: &str) -> String {
    let (flow, step) = flow_step(event_type);
    format!("group:dlq:{flow}:{step}")
}

type Fields = HashMap<String, redis::Value>;
type HandlerMap<E> = RwLock<HashMap<String, Vec<Arc<dyn EventHandler<E>>>>>;

struct RedisInner<E: BusEvent> {
    client: redis::Client,
    /// Shared publish connection; consumers use dedicated connections
    publish_conn: ConnectionManager,
    registry: EventRegistry<E>,
    handlers: HandlerMap<E>,
    consuming: RwLock<HashSet<String>>,
    dlq: DlqConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

pub struct RedisBus<E: BusEvent> {
    inner: Arc<RedisInner<E>>,
    worker: DlqWorker,
}

impl<E: BusEvent> RedisBus<E> {
    /// Connect to Redis and build a bus around the given registry.
    ///
    /// Fails with [`BusError::Config`] for an unparsable URL and
    /// [`BusError::Unavailable`] when the server cannot be reached.
    pub async fn connect(
        url: &str,
        registry: EventRegistry<E>,
        dlq: DlqConfig,
    ) -> BusResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BusError::Config(format!("invalid redis url: {e}")))?;
        let publish_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Unavailable(format!("redis connect failed: {e}")))?;

        Ok(Self {
            inner: Arc::new(RedisInner {
                client,
                publish_conn,
                registry,
                handlers: RwLock::new(HashMap::new()),
                consuming: RwLock::new(HashSet::new()),
                dlq,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            worker: DlqWorker::new(),
        })
    }

    /// Start the background DLQ retry worker. Idempotent: a second call
    /// while the worker is running is a no-op.
    pub fn start_dlq_worker(&self) {
        let inner = self.inner.clone();
        self.worker.start(async move {
            let mut conn = match inner.new_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "dlq worker could not open a redis connection");
                    return;
                }
            };

            let mut ticker = tokio::time::interval(inner.dlq.retry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for event_type in inner.registry.known_types() {
                            if inner.cancel.is_cancelled() {
                                break;
                            }
                            if let Err(e) = inner.sweep_dlq(&mut conn, &event_type).await {
                                warn!(event_type = %event_type, error = %e, "dlq sweep failed");
                            }
                        }
                    }
                }
            }
            info!("redis dlq worker stopped");
        });
    }
}

#[async_trait]
impl<E: BusEvent> EventBus<E> for RedisBus<E> {
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

        let mut conn = self
            .inner
            .new_connection()
            .await
            .map_err(|e| BusError::Register {
                event_type: event_type.to_string(),
                reason: e.to_string(),
            })?;

        let stream = stream_name(event_type);
        let group = group_name(event_type);
        let consumer = consumer_name(event_type);

        ensure_group(&mut conn, &stream, &group)
            .await
            .map_err(|e| BusError::Register {
                event_type: event_type.to_string(),
                reason: format!("group create failed: {e}"),
            })?;

        if let Err(e) = reap_stale_consumers(&mut conn, &stream, &group, &consumer).await {
            warn!(stream = %stream, error = %e, "stale consumer cleanup failed");
        }

        let inner = self.inner.clone();
        let event_type = event_type.to_string();
        self.inner.tracker.spawn(async move {
            inner.consume_loop(conn, event_type).await;
        });

        Ok(())
    }

    async fn emit(&self, event: &E) -> BusResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let envelope = Envelope::from_event(event)?;
        let payload = envelope.encode()?;
        let stream = stream_name(event.event_type());

        let mut conn = self.inner.publish_conn.clone();
        let _: String = conn
            .xadd(&stream, "*", &[("event", payload)])
            .await
            .map_err(|e| BusError::Publish(format!("XADD {stream} failed: {e}")))?;

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

impl<E: BusEvent> RedisInner<E> {
    async fn new_connection(&self) -> Result<ConnectionManager, redis::RedisError> {
        ConnectionManager::new(self.client.clone()).await
    }

    /// Long-lived consumer loop for one event type.
    ///
    /// Drains this consumer's own pending backlog first (crash recovery and
    /// entries claimed from reaped consumers), then blocks on new ids.
    async fn consume_loop(self: Arc<Self>, mut conn: ConnectionManager, event_type: String) {
        let stream = stream_name(&event_type);
        let group = group_name(&event_type);
        let consumer = consumer_name(&event_type);
        info!(stream = %stream, group = %group, "consumer started");

        loop {
            match read_group(&mut conn, &stream, &group, &consumer, "0", READ_COUNT, 0).await {
                Ok(backlog) if backlog.is_empty() => break,
                Ok(backlog) => {
                    let mut all_settled = true;
                    for (id, fields) in backlog {
                        all_settled &=
                            self.process_message(&mut conn, &event_type, &id, fields).await;
                    }
                    // An unsettled entry stays pending; rereading it now
                    // would just spin
                    if !all_settled {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = %stream, error = %e, "pending backlog read failed");
                    break;
                }
            }
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = read_group(
                    &mut conn,
                    &stream,
                    &group,
                    &consumer,
                    ">",
                    READ_COUNT,
                    READ_BLOCK_MS,
                ) => read,
            };

            match read {
                // A nil reply just means the block window elapsed
                Ok(messages) => {
                    for (id, fields) in messages {
                        self.process_message(&mut conn, &event_type, &id, fields).await;
                    }
                }
                Err(e) => {
                    error!(stream = %stream, error = %e, "group read failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(stream = %stream, "consumer stopped");
    }

    /// Decode, dispatch, and settle one stream entry.
    ///
    /// Ack rule: ack iff all handlers succeeded or the DLQ copy was written.
    /// Returns whether the entry was settled (acked); an unsettled entry is
    /// still pending and will be redelivered.
    async fn process_message(
        &self,
        conn: &mut ConnectionManager,
        event_type: &str,
        id: &str,
        fields: Fields,
    ) -> bool {
        let stream = stream_name(event_type);
        let group = group_name(event_type);
        let dlq = dlq_stream_name(event_type);

        let Some(raw) = field_bytes(&fields, "event") else {
            warn!(stream = %stream, message_id = %id, "entry has no event field, dead-lettering");
            return self.dead_letter_and_ack(conn, &stream, &group, &dlq, id, &fields).await;
        };

        let envelope = match Envelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(stream = %stream, message_id = %id, error = %e, "undecodable envelope, dead-lettering");
                return self.dead_letter_and_ack(conn, &stream, &group, &dlq, id, &fields).await;
            }
        };

        let event = match self.registry.decode(&envelope.event_type, envelope.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    stream = %stream,
                    message_id = %id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "unknown or malformed event, dead-lettering"
                );
                return self.dead_letter_and_ack(conn, &stream, &group, &dlq, id, &fields).await;
            }
        };

        let snapshot = {
            let guard = self.handlers.read().await;
            guard.get(&envelope.event_type).cloned().unwrap_or_default()
        };
        if snapshot.is_empty() {
            warn!(
                stream = %stream,
                message_id = %id,
                event_type = %envelope.event_type,
                "no handler registered for event type, dead-lettering"
            );
            return self.dead_letter_and_ack(conn, &stream, &group, &dlq, id, &fields).await;
        }

        let results = join_all(snapshot.iter().map(|h| h.handle(event.clone()))).await;
        let failed = results.iter().filter_map(|r| r.as_ref().err()).count();

        if failed == 0 {
            self.ack(conn, &stream, &group, id).await;
            return true;
        }

        warn!(
            stream = %stream,
            message_id = %id,
            event_type = %envelope.event_type,
            failed_handlers = failed,
            "handler failure, routing message to dlq"
        );
        self.dead_letter_and_ack(conn, &stream, &group, &dlq, id, &fields).await
    }

    /// Copy the raw entry to the DLQ stream, then acknowledge the original.
    ///
    /// The copy keeps every original field (including any `retry_count`) and
    /// adds `original_id` / `failed_at` lineage metadata. If the copy cannot
    /// be written the original is left pending so the group redelivers it.
    async fn dead_letter_and_ack(
        &self,
        conn: &mut ConnectionManager,
        stream: &str,
        group: &str,
        dlq: &str,
        id: &str,
        fields: &Fields,
    ) -> bool {
        let mut entry: Vec<(String, Vec<u8>)> = fields
            .iter()
            .filter_map(|(k, v)| {
                redis::from_redis_value::<Vec<u8>>(v)
                    .ok()
                    .map(|bytes| (k.clone(), bytes))
            })
            .collect();
        entry.push(("original_id".to_string(), id.as_bytes().to_vec()));
        entry.push(("failed_at".to_string(), Utc::now().to_rfc3339().into_bytes()));

        let written: Result<String, redis::RedisError> = conn.xadd(dlq, "*", &entry).await;
        match written {
            Ok(_) => {
                self.ack(conn, stream, group, id).await;
                true
            }
            Err(e) => {
                error!(
                    stream = %stream,
                    dlq = %dlq,
                    message_id = %id,
                    error = %e,
                    "dlq write failed, leaving message pending for redelivery"
                );
                false
            }
        }
    }

    async fn ack(&self, conn: &mut ConnectionManager, stream: &str, group: &str, id: &str) {
        let acked: Result<u64, redis::RedisError> = conn.xack(stream, group, &[id]).await;
        if let Err(e) = acked {
            error!(stream = %stream, message_id = %id, error = %e, "XACK failed");
        }
    }

    /// One DLQ sweep for one event type: republish up to `batch_size`
    /// dead-lettered entries to the original stream with bumped retry counts.
    async fn sweep_dlq(
        &self,
        conn: &mut ConnectionManager,
        event_type: &str,
    ) -> Result<(), redis::RedisError> {
        let dlq = dlq_stream_name(event_type);
        let stream = stream_name(event_type);
        let group = dlq_group_name(event_type);

        let len: u64 = conn.xlen(&dlq).await?;
        if len == 0 {
            return Ok(());
        }

        ensure_group(conn, &dlq, &group).await?;

        // New entries first, then this consumer's pending (claim fallback),
        // then the raw backlog for entries that predate the group.
        let mut via_group = true;
        let mut messages =
            read_group(conn, &dlq, &group, DLQ_CONSUMER, ">", self.dlq.batch_size, 0).await?;
        if messages.is_empty() {
            messages =
                read_group(conn, &dlq, &group, DLQ_CONSUMER, "0", self.dlq.batch_size, 0).await?;
        }
        if messages.is_empty() {
            via_group = false;
            messages = read_backlog(conn, &dlq, self.dlq.batch_size).await?;
        }

        for (id, fields) in messages {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let retry_count = parse_retry_count(field_string(&fields, "retry_count").as_deref());
            if retry_count >= self.dlq.max_retries {
                warn!(
                    dlq = %dlq,
                    message_id = %id,
                    retry_count,
                    "retries exhausted, dropping dead-lettered message"
                );
                self.settle_dlq_entry(conn, &dlq, &group, &id, via_group).await?;
                continue;
            }

            let Some(payload) = field_bytes(&fields, "event") else {
                warn!(dlq = %dlq, message_id = %id, "dead-lettered entry has no event field, dropping");
                self.settle_dlq_entry(conn, &dlq, &group, &id, via_group).await?;
                continue;
            };

            let delay = backoff_delay(&self.dlq, retry_count);
            debug!(dlq = %dlq, message_id = %id, retry_count, delay_secs = delay.as_secs(), "retrying dead-lettered message");
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            let next: Vec<(String, Vec<u8>)> = vec![
                ("event".to_string(), payload),
                (
                    "retry_count".to_string(),
                    (retry_count + 1).to_string().into_bytes(),
                ),
            ];
            let _: String = conn.xadd(&stream, "*", &next).await?;

            self.settle_dlq_entry(conn, &dlq, &group, &id, via_group).await?;
        }

        Ok(())
    }

    async fn settle_dlq_entry(
        &self,
        conn: &mut ConnectionManager,
        dlq: &str,
        group: &str,
        id: &str,
        via_group: bool,
    ) -> Result<(), redis::RedisError> {
        if via_group {
            let _: u64 = conn.xack(dlq, group, &[id]).await?;
        }
        let _: u64 = conn.xdel(dlq, &[id]).await?;
        Ok(())
    }
}

/// `XGROUP CREATE ... 0 MKSTREAM`, tolerating an already-existing group.
///
/// Starting at `0` makes pre-existing stream entries consumable.
async fn ensure_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> Result<(), redis::RedisError> {
    let created: Result<String, redis::RedisError> =
        conn.xgroup_create_mkstream(stream, group, "0").await;
    match created {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e),
    }
}

/// Claim entries stuck with other consumers for over five minutes, then
/// delete those consumers from the group.
async fn reap_stale_consumers(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
    consumer: &str,
) -> Result<(), redis::RedisError> {
    let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
        .arg(stream)
        .arg(group)
        .arg("IDLE")
        .arg(STALE_PENDING_MS)
        .arg("-")
        .arg("+")
        .arg(100)
        .query_async(conn)
        .await
        .unwrap_or_default();

    let mut stale_ids = Vec::new();
    let mut stale_consumers = HashSet::new();
    for (id, owner, _idle, _deliveries) in pending {
        if owner != consumer {
            stale_ids.push(id);
            stale_consumers.insert(owner);
        }
    }

    if stale_ids.is_empty() {
        return Ok(());
    }

    let mut claim = redis::cmd("XCLAIM");
    claim
        .arg(stream)
        .arg(group)
        .arg(consumer)
        .arg(STALE_PENDING_MS);
    for id in &stale_ids {
        claim.arg(id);
    }
    claim.arg("JUSTID");
    let _: redis::Value = claim.query_async(conn).await?;

    for stale in stale_consumers {
        info!(stream = %stream, consumer = %stale, "removing stale consumer from group");
        let _: redis::Value = redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(stream)
            .arg(group)
            .arg(&stale)
            .query_async(conn)
            .await?;
    }

    Ok(())
}

async fn read_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
    consumer: &str,
    id: &str,
    count: usize,
    block_ms: u64,
) -> Result<Vec<(String, Fields)>, redis::RedisError> {
    let mut opts = StreamReadOptions::default()
        .group(group, consumer)
        .count(count);
    if block_ms > 0 {
        opts = opts.block(block_ms as usize);
    }

    let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[id], &opts).await?;
    Ok(flatten_reply(reply))
}

async fn read_backlog(
    conn: &mut ConnectionManager,
    stream: &str,
    count: usize,
) -> Result<Vec<(String, Fields)>, redis::RedisError> {
    let opts = StreamReadOptions::default().count(count);
    let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &["0"], &opts).await?;
    Ok(flatten_reply(reply))
}

fn flatten_reply(reply: Option<StreamReadReply>) -> Vec<(String, Fields)> {
    let Some(reply) = reply else {
        return Vec::new();
    };
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids.into_iter().map(|entry| (entry.id, entry.map)))
        .collect()
}

fn field_bytes(fields: &Fields, key: &str) -> Option<Vec<u8>> {
    fields
        .get(key)
        .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok())
}

fn field_string(fields: &Fields, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(|v| redis::from_redis_value::<String>(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_stream_convention() {
        assert_eq!(stream_name("deposit.requested"), "events:deposit:requested");
        assert_eq!(dlq_stream_name("deposit.requested"), "dlq:deposit:requested");
        assert_eq!(group_name("deposit.requested"), "group:deposit:requested");
        assert_eq!(
            consumer_name("deposit.requested"),
            "consumer:deposit:requested"
        );
        assert_eq!(
            dlq_group_name("transfer.domain_done"),
            "group:dlq:transfer:domain_done"
        );
    }

    // Integration tests require a running Redis >= 7.0:
    //   docker run -p 6379:6379 redis:7-alpine
    mod integration {
        use super::super::*;
        use crate::HandlerError;
        use serde::{Deserialize, Serialize};
        use std::sync::Mutex;

        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct TestEvent {
            seq: u64,
        }

        impl BusEvent for TestEvent {
            fn event_type(&self) -> &'static str {
                "redistest.ping"
            }

            fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
                serde_json::to_value(self)
            }
        }

        struct Capture {
            seen: Arc<Mutex<Vec<u64>>>,
        }

        #[async_trait]
        impl EventHandler<TestEvent> for Capture {
            async fn handle(&self, event: TestEvent) -> Result<(), HandlerError> {
                self.seen.lock().unwrap().push(event.seq);
                Ok(())
            }
        }

        #[tokio::test]
        #[ignore] // Requires Redis server
        async fn emit_reaches_registered_handler() {
            let mut registry = EventRegistry::new();
            registry.register("redistest.ping", |payload| {
                serde_json::from_value::<TestEvent>(payload).map_err(|source| {
                    crate::DecodeError::Payload {
                        event_type: "redistest.ping".to_string(),
                        source,
                    }
                })
            });

            let bus = RedisBus::connect("redis://127.0.0.1:6379", registry, DlqConfig::default())
                .await
                .expect("redis must be running on localhost:6379");

            let seen = Arc::new(Mutex::new(Vec::new()));
            bus.register("redistest.ping", Arc::new(Capture { seen: seen.clone() }))
                .await
                .unwrap();

            bus.emit(&TestEvent { seq: 42 }).await.unwrap();

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(*seen.lock().unwrap(), vec![42]);

            bus.close().await.unwrap();
        }
    }
}
