use std::time::Duration;

use stream_bus::{BusError, Producer};
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics;

/// Fixed-delay retry bound for bus writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("delivery to topic {topic} failed: {source}")]
    DeliveryFailed {
        topic: String,
        attempts: u32,
        #[source]
        source: BusError,
    },
}

/// Writes into the single topic owned by one stream.
pub struct Publisher {
    producer: Box<dyn Producer>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(producer: Box<dyn Producer>, retry: RetryPolicy) -> Self {
        Self { producer, retry }
    }

    pub fn topic(&self) -> &str {
        self.producer.topic()
    }

    pub async fn send(&self, key: &[u8], value: &[u8]) -> Result<(), PublishError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.producer.send(key, value).await {
                Ok(()) => {
                    metrics::record_produced();
                    info!(topic = %self.topic(), attempt, "produced message");
                    return Ok(());
                }
                Err(err) => {
                    metrics::record_produce_failure();
                    warn!(
                        topic = %self.topic(),
                        attempt,
                        key = %String::from_utf8_lossy(key),
                        error = %err,
                        "failed to write message to bus"
                    );
                    if attempt >= max_attempts {
                        return Err(PublishError::DeliveryFailed {
                            topic: self.topic().to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }

    pub async fn close(&self) {
        self.producer.close().await;
        info!(topic = %self.topic(), "publisher closed");
    }
}
