use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[cfg(feature = "kafka")]
mod kafka;
mod local;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaSettings};
pub use local::{LocalBroker, LocalBrokerStats};

/// A record read back from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub offset: i64,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Factory for topic-bound producers and consumer-group readers.
///
/// Connection establishment happens here; implementations report an
/// unreachable broker as [`BusError::Unavailable`] and never retry.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn producer(&self, topic: &str) -> BusResult<Box<dyn Producer>>;
    async fn consumer(&self, topic: &str, group_id: &str) -> BusResult<Box<dyn Consumer>>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn topic(&self) -> &str;
    async fn send(&self, key: &[u8], payload: &[u8]) -> BusResult<()>;
    async fn close(&self);
}

#[async_trait]
pub trait Consumer: Send {
    fn topic(&self) -> &str;

    /// Waits for the next record for this consumer's group.
    ///
    /// `Ok(None)` is the end-of-stream signal: the topic will yield nothing
    /// further to this reader. Dropping the returned future before it
    /// resolves must not lose a record.
    async fn recv(&mut self) -> BusResult<Option<BusMessage>>;

    async fn close(&mut self);
}
