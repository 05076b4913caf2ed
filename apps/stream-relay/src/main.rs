use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stream_bus::{Broker, LocalBroker};
use stream_relay::{config::BusBackend, telemetry::Telemetry, AppState, Cli, RelayConfig};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init(&config)?;
    info!(
        listen_addr = %config.listen_addr,
        bus = ?config.bus,
        auth_configured = config.api_key.is_some(),
        rate_per_sec = config.rate_per_sec,
        rate_burst = config.rate_burst,
        "starting stream-relay"
    );
    if config.api_key.is_none() {
        warn!("API_KEY is not set; every stream request will be rejected");
    }

    let broker = connect_broker(&config)?;
    let state = AppState::new(&config, broker, telemetry.metrics_handle());
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    stream_relay::serve(listener, state, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

fn connect_broker(config: &RelayConfig) -> Result<Arc<dyn Broker>> {
    match config.bus {
        BusBackend::Memory => {
            warn!("using in-process bus; messages are lost on restart");
            Ok(Arc::new(LocalBroker::new()))
        }
        #[cfg(feature = "kafka")]
        BusBackend::Kafka => {
            let settings = stream_bus::KafkaSettings {
                brokers: config.kafka_brokers.clone(),
                operation_timeout: config.kafka_timeout,
                ..Default::default()
            };
            let broker = stream_bus::KafkaBroker::connect(settings)
                .with_context(|| format!("failed to connect to kafka at {}", config.kafka_brokers))?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "kafka"))]
        BusBackend::Kafka => anyhow::bail!(
            "kafka bus requested but stream-relay was built without the `kafka` feature"
        ),
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
