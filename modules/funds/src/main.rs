use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use event_bus::{EventBus, KafkaBus, MemoryBus, RedisBus};
use funds_rs::config::{BusKind, Config};
use funds_rs::events::{flow_event_registry, FlowEvent};
use funds_rs::providers::{
    ExchangeRateProvider, FixedRates, HttpExchangeRateProvider, HttpPaymentProvider,
    MockPaymentProvider, PaymentProvider,
};
use funds_rs::{db, workflows};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting funds service...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let registry = flow_event_registry();

    let bus: Arc<dyn EventBus<FlowEvent>> = match config.bus_kind {
        BusKind::Memory => {
            tracing::info!("Using in-memory event bus");
            Arc::new(MemoryBus::bounded(1024))
        }
        BusKind::Redis => {
            let url = config.redis_url().expect("Invalid bus configuration");
            tracing::info!("Connecting to Redis at {url}");
            let bus = RedisBus::connect(url, registry, config.dlq.clone())
                .await
                .expect("Failed to connect to Redis");
            bus.start_dlq_worker();
            Arc::new(bus)
        }
        BusKind::Kafka => {
            let kafka = config.kafka_config().expect("Invalid bus configuration");
            tracing::info!("Connecting to Kafka at {}", kafka.brokers);
            let bus = KafkaBus::new(kafka, registry).expect("Failed to start Kafka bus");
            bus.start_dlq_worker();
            Arc::new(bus)
        }
    };

    let rates: Arc<dyn ExchangeRateProvider> = match &config.exchange_rate_url {
        Some(url) => Arc::new(HttpExchangeRateProvider::new(url.clone())),
        None => {
            tracing::warn!("EXCHANGE_RATE_URL not set, only same-currency conversion will succeed");
            Arc::new(FixedRates::new())
        }
    };
    let payments: Arc<dyn PaymentProvider> = match &config.payment_provider_url {
        Some(url) => Arc::new(HttpPaymentProvider::new(url.clone())),
        None => {
            tracing::warn!("PAYMENT_PROVIDER_URL not set, using the in-process mock provider");
            Arc::new(MockPaymentProvider::new())
        }
    };

    workflows::register_all(&bus, &pool, rates, payments)
        .await
        .expect("Failed to register workflow handlers");

    tracing::info!("Funds service running, workflow handlers registered");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");

    tracing::info!("Shutting down, draining in-flight handlers...");
    if let Err(e) = bus.close().await {
        tracing::error!(error = %e, "bus shutdown failed");
    }
    tracing::info!("Funds service stopped");
}
