use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use stream_bus::Broker;

use crate::{
    config::RelayConfig,
    push::PushTargetRegistry,
    rate_gate::RateGate,
    session::SessionRegistry,
    transform::{ProcessedStamp, Transform},
};

pub struct AppState {
    pub sessions: SessionRegistry,
    pub push_targets: PushTargetRegistry,
    pub rate_gate: RateGate,
    pub transform: Arc<dyn Transform>,
    pub api_key: Option<String>,
    pub push_buffer: usize,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(config: &RelayConfig, broker: Arc<dyn Broker>, metrics: PrometheusHandle) -> Arc<Self> {
        Self::with_transform(config, broker, metrics, Arc::new(ProcessedStamp))
    }

    pub fn with_transform(
        config: &RelayConfig,
        broker: Arc<dyn Broker>,
        metrics: PrometheusHandle,
        transform: Arc<dyn Transform>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionRegistry::new(broker, config.retry),
            push_targets: PushTargetRegistry::new(),
            rate_gate: RateGate::new(config.rate_per_sec, config.rate_burst),
            transform,
            api_key: config.api_key.clone(),
            push_buffer: config.push_buffer,
            metrics,
        })
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }

    /// Drops every push connection, then releases all bus resources.
    pub async fn shutdown(&self) {
        let disconnected = self.push_targets.disconnect_all();
        tracing::info!(disconnected, "push connections closed for shutdown");
        self.sessions.shutdown().await;
    }
}
