//! In-memory implementation of the EventBus trait for tests and single-node
//! installs.
//!
//! Two dispatch modes:
//!
//! - [`MemoryBus::new`] delivers synchronously: `emit` walks every handler
//!   registered for the event type and awaits them in parallel before
//!   returning. A full workflow chain therefore runs to completion inside
//!   the originating `emit`, which makes end-to-end tests deterministic.
//! - [`MemoryBus::bounded`] enqueues onto a bounded channel drained by a
//!   background dispatcher that spawns one task per (handler, event) pair.
//!   `close` waits for the queue to drain and for every in-flight handler.
//!
//! Handler errors are logged and never block further delivery; the memory
//! transport has no DLQ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::{BusError, BusEvent, BusResult, EventBus, EventHandler};

type HandlerMap<E> = Arc<RwLock<HashMap<String, Vec<Arc<dyn EventHandler<E>>>>>>;

pub struct MemoryBus<E: BusEvent> {
    handlers: HandlerMap<E>,
    queue: Mutex<Option<mpsc::Sender<E>>>,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl<E: BusEvent> MemoryBus<E> {
    /// Synchronous variant: `emit` returns after every handler ran
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            queue: Mutex::new(None),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Asynchronous variant: `emit` enqueues onto a bounded channel drained
    /// by a background dispatcher
    pub fn bounded(capacity: usize) -> Self {
        let bus = Self::new();
        let (tx, mut rx) = mpsc::channel::<E>(capacity);

        let handlers = bus.handlers.clone();
        let tracker = bus.tracker.clone();
        bus.tracker.spawn(async move {
            while let Some(event) = rx.recv().await {
                let snapshot = {
                    let guard = handlers.read().await;
                    guard.get(event.event_type()).cloned().unwrap_or_default()
                };
                for handler in snapshot {
                    let event = event.clone();
                    tracker.spawn(async move {
                        if let Err(e) = handler.handle(event).await {
                            warn!(error = %e, "handler failed on memory bus");
                        }
                    });
                }
            }
        });

        *bus.queue.lock().expect("queue lock poisoned") = Some(tx);
        bus
    }

    async fn dispatch(&self, event: E) {
        let event_type = event.event_type();
        let snapshot = {
            let guard = self.handlers.read().await;
            guard.get(event_type).cloned().unwrap_or_default()
        };

        if snapshot.is_empty() {
            debug!(event_type, "no handlers registered, dropping event");
            return;
        }

        let results = join_all(
            snapshot
                .iter()
                .map(|handler| handler.handle(event.clone())),
        )
        .await;

        for result in results {
            if let Err(e) = result {
                warn!(event_type, error = %e, "handler failed on memory bus");
            }
        }
    }
}

impl<E: BusEvent> Default for MemoryBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: BusEvent> EventBus<E> for MemoryBus<E> {
    async fn register(&self, event_type: &str, handler: Arc<dyn EventHandler<E>>) -> BusResult<()> {
        let mut guard = self.handlers.write().await;
        guard.entry(event_type.to_string()).or_default().push(handler);
        Ok(())
    }

    async fn emit(&self, event: &E) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let sender = {
            let guard = self.queue.lock().expect("queue lock poisoned");
            guard.clone()
        };

        match sender {
            Some(tx) => tx
                .send(event.clone())
                .await
                .map_err(|_| BusError::Closed),
            None => {
                self.dispatch(event.clone()).await;
                Ok(())
            }
        }
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the sender lets the dispatcher drain the queue and exit;
        // the tracker then waits for the dispatcher and every spawned
        // (handler, event) task.
        self.queue.lock().expect("queue lock poisoned").take();
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HandlerError;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestEvent {
        seq: u64,
    }

    impl BusEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            "test.ping"
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

    struct Failing;

    #[async_trait]
    impl EventHandler<TestEvent> for Failing {
        async fn handle(&self, _event: TestEvent) -> Result<(), HandlerError> {
            Err(HandlerError::transient("boom"))
        }
    }

    #[tokio::test]
    async fn sync_emit_delivers_to_registered_handler() {
        let bus = MemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register("test.ping", Arc::new(Capture { seen: seen.clone() }))
            .await
            .unwrap();

        bus.emit(&TestEvent { seq: 1 }).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn sync_emit_preserves_order() {
        let bus = MemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register("test.ping", Arc::new(Capture { seen: seen.clone() }))
            .await
            .unwrap();

        for seq in 0..5 {
            bus.emit(&TestEvent { seq }).await.unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn all_handlers_for_a_type_are_invoked() {
        let bus = MemoryBus::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        bus.register("test.ping", Arc::new(Capture { seen: first.clone() }))
            .await
            .unwrap();
        bus.register("test.ping", Arc::new(Capture { seen: second.clone() }))
            .await
            .unwrap();

        bus.emit(&TestEvent { seq: 9 }).await.unwrap();

        assert_eq!(*first.lock().unwrap(), vec![9]);
        assert_eq!(*second.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn handler_failure_does_not_block_other_handlers() {
        let bus = MemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register("test.ping", Arc::new(Failing)).await.unwrap();
        bus.register("test.ping", Arc::new(Capture { seen: seen.clone() }))
            .await
            .unwrap();

        bus.emit(&TestEvent { seq: 2 }).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn unregistered_event_type_is_dropped() {
        let bus: MemoryBus<TestEvent> = MemoryBus::new();
        // No registration at all: emit must not error
        bus.emit(&TestEvent { seq: 3 }).await.unwrap();
    }

    #[tokio::test]
    async fn bounded_close_waits_for_in_flight_handlers() {
        struct Slow {
            seen: Arc<Mutex<Vec<u64>>>,
        }

        #[async_trait]
        impl EventHandler<TestEvent> for Slow {
            async fn handle(&self, event: TestEvent) -> Result<(), HandlerError> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.seen.lock().unwrap().push(event.seq);
                Ok(())
            }
        }

        let bus = MemoryBus::bounded(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register("test.ping", Arc::new(Slow { seen: seen.clone() }))
            .await
            .unwrap();

        for seq in 0..3 {
            bus.emit(&TestEvent { seq }).await.unwrap();
        }
        bus.close().await.unwrap();

        let mut observed = seen.lock().unwrap().clone();
        observed.sort_unstable();
        assert_eq!(observed, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn emit_after_close_is_rejected() {
        let bus: MemoryBus<TestEvent> = MemoryBus::bounded(4);
        bus.close().await.unwrap();

        assert!(matches!(
            bus.emit(&TestEvent { seq: 1 }).await,
            Err(BusError::Closed)
        ));
    }
}
