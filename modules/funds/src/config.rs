use std::env;
use std::time::Duration;

use event_bus::{DlqConfig, KafkaConfig};

/// Which event bus transport the process runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Memory,
    Redis,
    Kafka,
}

impl std::str::FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BusKind::Memory),
            "redis" => Ok(BusKind::Redis),
            "kafka" => Ok(BusKind::Kafka),
            other => Err(format!(
                "invalid BUS_KIND: {other}. Must be 'memory', 'redis', or 'kafka'"
            )),
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_kind: BusKind,
    pub redis_url: Option<String>,
    pub kafka_brokers: Option<String>,
    pub topic_prefix: String,
    pub group_id: String,
    pub kafka_tls_enabled: bool,
    pub kafka_tls_ca: Option<String>,
    pub kafka_tls_cert: Option<String>,
    pub kafka_tls_key: Option<String>,
    pub kafka_sasl_username: Option<String>,
    pub kafka_sasl_password: Option<String>,
    pub dlq: DlqConfig,
    pub exchange_rate_url: Option<String>,
    pub payment_provider_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let bus_kind: BusKind = env::var("BUS_KIND")
            .unwrap_or_else(|_| "memory".to_string())
            .parse()?;

        let topic_prefix =
            env::var("BUS_TOPIC_PREFIX").unwrap_or_else(|_| "fintech.events".to_string());
        let group_id = env::var("BUS_GROUP_ID").unwrap_or_else(|_| "fintech".to_string());

        let defaults = DlqConfig::default();
        let dlq = DlqConfig {
            retry_interval: Duration::from_secs(env_parse(
                "DLQ_RETRY_INTERVAL_SECS",
                defaults.retry_interval.as_secs(),
            )?),
            batch_size: env_parse("DLQ_BATCH_SIZE", defaults.batch_size)?,
            max_retries: env_parse("DLQ_MAX_RETRIES", defaults.max_retries)?,
            initial_backoff: Duration::from_secs(env_parse(
                "DLQ_INITIAL_BACKOFF_SECS",
                defaults.initial_backoff.as_secs(),
            )?),
            max_backoff: Duration::from_secs(env_parse(
                "DLQ_MAX_BACKOFF_SECS",
                defaults.max_backoff.as_secs(),
            )?),
        };

        Ok(Config {
            database_url,
            bus_kind,
            redis_url: env::var("BUS_REDIS_URL").ok(),
            kafka_brokers: env::var("BUS_KAFKA_BROKERS").ok(),
            topic_prefix,
            group_id,
            kafka_tls_enabled: env_parse("KAFKA_TLS_ENABLED", false)?,
            kafka_tls_ca: env::var("KAFKA_TLS_CA").ok(),
            kafka_tls_cert: env::var("KAFKA_TLS_CERT").ok(),
            kafka_tls_key: env::var("KAFKA_TLS_KEY").ok(),
            kafka_sasl_username: env::var("KAFKA_SASL_USERNAME").ok(),
            kafka_sasl_password: env::var("KAFKA_SASL_PASSWORD").ok(),
            dlq,
            exchange_rate_url: env::var("EXCHANGE_RATE_URL").ok(),
            payment_provider_url: env::var("PAYMENT_PROVIDER_URL").ok(),
        })
    }

    /// Redis URL, required when `BUS_KIND=redis`
    pub fn redis_url(&self) -> Result<&str, String> {
        self.redis_url
            .as_deref()
            .ok_or_else(|| "BUS_REDIS_URL must be set when BUS_KIND=redis".to_string())
    }

    /// Kafka transport settings, required when `BUS_KIND=kafka`
    pub fn kafka_config(&self) -> Result<KafkaConfig, String> {
        let brokers = self
            .kafka_brokers
            .clone()
            .ok_or_else(|| "BUS_KAFKA_BROKERS must be set when BUS_KIND=kafka".to_string())?;

        Ok(KafkaConfig {
            brokers,
            topic_prefix: self.topic_prefix.clone(),
            group_id: self.group_id.clone(),
            tls_enabled: self.kafka_tls_enabled,
            tls_ca: self.kafka_tls_ca.clone(),
            tls_cert: self.kafka_tls_cert.clone(),
            tls_key: self.kafka_tls_key.clone(),
            sasl_username: self.kafka_sasl_username.clone(),
            sasl_password: self.kafka_sasl_password.clone(),
            dlq: self.dlq.clone(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| format!("{name} has an invalid value: {raw}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_kind_parses_known_values() {
        assert_eq!("memory".parse::<BusKind>().unwrap(), BusKind::Memory);
        assert_eq!("Redis".parse::<BusKind>().unwrap(), BusKind::Redis);
        assert_eq!("KAFKA".parse::<BusKind>().unwrap(), BusKind::Kafka);
    }

    #[test]
    fn bus_kind_rejects_unknown_values() {
        assert!("rabbitmq".parse::<BusKind>().is_err());
    }
}
