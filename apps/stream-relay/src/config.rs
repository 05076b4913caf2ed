use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

use crate::publisher::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BusBackend {
    /// Kafka cluster reached through `--kafka-brokers`.
    Kafka,
    /// In-process log; data does not survive a restart.
    Memory,
}

impl Default for BusBackend {
    #[cfg(feature = "kafka")]
    fn default() -> Self {
        BusBackend::Kafka
    }

    #[cfg(not(feature = "kafka"))]
    fn default() -> Self {
        BusBackend::Memory
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "stream-relay",
    author,
    version,
    about = "Queue stream data on a message bus and push processed results over WebSocket"
)]
pub struct Cli {
    /// Address the HTTP listener binds to.
    #[arg(long, env = "STREAM_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Message bus backend.
    #[arg(long, env = "STREAM_RELAY_BUS", value_enum, default_value_t = BusBackend::default())]
    pub bus: BusBackend,

    /// Comma separated Kafka bootstrap servers.
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    pub kafka_brokers: String,

    /// Timeout for Kafka admin operations and message delivery.
    #[arg(long, env = "KAFKA_TIMEOUT_SECS", default_value_t = 5)]
    pub kafka_timeout_secs: u64,

    /// Value every client must present in the X-API-Key header.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Sustained admissions per second on the stream routes.
    #[arg(long, env = "STREAM_RELAY_RATE_PER_SEC", default_value_t = 5.0)]
    pub rate_per_sec: f64,

    /// Admissions allowed in a burst before the rate applies.
    #[arg(long, env = "STREAM_RELAY_RATE_BURST", default_value_t = 10)]
    pub rate_burst: u32,

    /// Attempts made to deliver one message to the bus.
    #[arg(long, env = "STREAM_RELAY_SEND_ATTEMPTS", default_value_t = 3)]
    pub send_attempts: u32,

    /// Pause between delivery attempts.
    #[arg(long, env = "STREAM_RELAY_SEND_RETRY_DELAY_MS", default_value_t = 2_000)]
    pub send_retry_delay_ms: u64,

    /// Outbound frames buffered per push connection.
    #[arg(long, env = "STREAM_RELAY_PUSH_BUFFER", default_value_t = 64)]
    pub push_buffer: usize,

    /// Tracing filter directive, RUST_LOG syntax.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[arg(long, env = "STREAM_RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Grace period applied during shutdown.
    #[arg(long, env = "STREAM_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub bus: BusBackend,
    pub kafka_brokers: String,
    pub kafka_timeout: Duration,
    pub api_key: Option<String>,
    pub rate_per_sec: f64,
    pub rate_burst: u32,
    pub retry: RetryPolicy,
    pub push_buffer: usize,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            bus: BusBackend::default(),
            kafka_brokers: "localhost:9092".to_string(),
            kafka_timeout: Duration::from_secs(5),
            api_key: None,
            rate_per_sec: 5.0,
            rate_burst: 10,
            retry: RetryPolicy::default(),
            push_buffer: 64,
            log_filter: "info".to_string(),
            log_format: LogFormat::Text,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if !(cli.rate_per_sec.is_finite() && cli.rate_per_sec > 0.0) {
            bail!("rate per second must be positive, got {}", cli.rate_per_sec);
        }
        if cli.rate_burst == 0 {
            bail!("rate burst must be at least 1");
        }
        if cli.send_attempts == 0 {
            bail!("send attempts must be at least 1");
        }
        if cli.push_buffer == 0 {
            bail!("push buffer must hold at least one frame");
        }
        let api_key = cli.api_key.filter(|key| !key.is_empty());

        Ok(RelayConfig {
            listen_addr,
            bus: cli.bus,
            kafka_brokers: cli.kafka_brokers,
            kafka_timeout: Duration::from_secs(cli.kafka_timeout_secs),
            api_key,
            rate_per_sec: cli.rate_per_sec,
            rate_burst: cli.rate_burst,
            retry: RetryPolicy {
                max_attempts: cli.send_attempts,
                delay: Duration::from_millis(cli.send_retry_delay_ms),
            },
            push_buffer: cli.push_buffer,
            log_filter: cli.log_filter,
            log_format: cli.log_format,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
