//! Dead-letter queue retry configuration shared by all bus transports

use std::time::Duration;

/// Knobs for the DLQ retry worker
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// How often the worker sweeps the dead-letter queues
    pub retry_interval: Duration,
    /// Max messages per sweep per event type
    pub batch_size: usize,
    /// Cap on republish attempts before a message is dropped for good
    pub max_retries: u32,
    /// Initial backoff before the first republish (doubles per retry)
    pub initial_backoff: Duration,
    /// Upper bound on the exponential backoff
    pub max_backoff: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(300),
            batch_size: 10,
            max_retries: 5,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(1800),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operational_contract() {
        let config = DlqConfig::default();

        assert_eq!(config.retry_interval, Duration::from_secs(5 * 60));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_backoff, Duration::from_secs(60));
        assert_eq!(config.max_backoff, Duration::from_secs(30 * 60));
    }
}
