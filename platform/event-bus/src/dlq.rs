//! DLQ retry worker scaffolding shared by the Redis and Kafka transports.
//!
//! Each bus instance owns one [`DlqWorker`]. Starting it is idempotent: a
//! second `start` while the sweep task is still running is a no-op. The
//! worker loops on a ticker, sweeping every known event type's dead-letter
//! queue; the transport-specific sweep lives with the transport, while the
//! backoff schedule and `retry_count` parsing live here.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::DlqConfig;

/// Delay before the `retry_count`-th republish of a dead-lettered message:
/// `min(initial_backoff * 2^retry_count, max_backoff)`.
pub fn backoff_delay(config: &DlqConfig, retry_count: u32) -> Duration {
    let doubled = config
        .initial_backoff
        .checked_mul(2u32.saturating_pow(retry_count))
        .unwrap_or(config.max_backoff);
    doubled.min(config.max_backoff)
}

/// Parse a `retry_count` metadata field.
///
/// Missing values default to 0. Malformed values also default to 0 but are
/// logged, so a producer resetting counts is at least visible.
pub(crate) fn parse_retry_count(raw: Option<&str>) -> u32 {
    match raw {
        None => 0,
        Some(s) => s.parse().unwrap_or_else(|_| {
            warn!(retry_count = %s, "malformed retry_count field, treating as 0");
            0
        }),
    }
}

/// Idempotent start/stop wrapper around the sweep task
pub(crate) struct DlqWorker {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DlqWorker {
    pub(crate) fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    /// Spawn the sweep loop unless one is already running.
    ///
    /// The future is expected to run until the bus's cancellation token
    /// fires; a finished previous run is cleaned up before respawning.
    pub(crate) fn start<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.handle.lock().expect("dlq worker lock poisoned");
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        *guard = Some(tokio::spawn(task));
    }

    /// Wait for the sweep loop to exit (after the bus cancelled it)
    pub(crate) async fn stop(&self) {
        let handle = {
            let mut guard = self.handle.lock().expect("dlq worker lock poisoned");
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry_up_to_cap() {
        let config = DlqConfig {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(1800),
            ..DlqConfig::default()
        };

        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(60));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(120));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(240));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(480));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(960));
        // 60 * 2^5 = 1920 > 1800
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(1800));
        assert_eq!(backoff_delay(&config, 30), Duration::from_secs(1800));
    }

    #[test]
    fn backoff_survives_absurd_retry_counts() {
        let config = DlqConfig::default();
        assert_eq!(backoff_delay(&config, u32::MAX), config.max_backoff);
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        assert_eq!(parse_retry_count(None), 0);
        assert_eq!(parse_retry_count(Some("not-a-number")), 0);
        assert_eq!(parse_retry_count(Some("")), 0);
    }

    #[test]
    fn retry_count_parses_valid_values() {
        assert_eq!(parse_retry_count(Some("0")), 0);
        assert_eq!(parse_retry_count(Some("3")), 3);
        assert_eq!(parse_retry_count(Some("17")), 17);
    }

    #[tokio::test]
    async fn worker_start_is_idempotent() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let worker = DlqWorker::new();
        let runs = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            worker.start(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                // Stay alive so later starts see a running task
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Drop the running task so the test exits promptly
        let handle = worker.handle.lock().unwrap().take().unwrap();
        handle.abort();
    }
}
