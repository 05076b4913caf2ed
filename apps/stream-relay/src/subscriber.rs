use std::sync::atomic::{AtomicBool, Ordering};

use stream_bus::{BusError, BusMessage, Consumer};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug)]
pub enum ReadOutcome {
    Message(BusMessage),
    /// The bus reported end of stream for this reader.
    NoDataYet,
    Cancelled,
    Fatal(BusError),
}

/// Consumer-group reader for one stream topic.
///
/// Only one read is in flight at a time. `close` wakes a blocked read before
/// releasing the underlying consumer.
pub struct Subscriber {
    topic: String,
    group_id: String,
    consumer: Mutex<Box<dyn Consumer>>,
    closing: CancellationToken,
    closed: AtomicBool,
}

impl Subscriber {
    pub fn new(consumer: Box<dyn Consumer>, group_id: impl Into<String>) -> Self {
        Self {
            topic: consumer.topic().to_string(),
            group_id: group_id.into(),
            consumer: Mutex::new(consumer),
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn read_next(&self, cancel: &CancellationToken) -> ReadOutcome {
        if cancel.is_cancelled() {
            return ReadOutcome::Cancelled;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ReadOutcome::Cancelled,
            _ = self.closing.cancelled() => ReadOutcome::Fatal(BusError::Closed),
            received = async {
                let mut consumer = self.consumer.lock().await;
                consumer.recv().await
            } => match received {
                Ok(Some(message)) => ReadOutcome::Message(message),
                Ok(None) => ReadOutcome::NoDataYet,
                Err(err) => ReadOutcome::Fatal(err),
            },
        }
    }

    pub async fn close(&self) {
        self.closing.cancel();
        let mut consumer = self.consumer.lock().await;
        consumer.close().await;
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(topic = %self.topic, group_id = %self.group_id, "subscriber closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use stream_bus::{Broker, LocalBroker};

    async fn subscriber(broker: &LocalBroker, topic: &str) -> Arc<Subscriber> {
        let consumer = broker
            .consumer(topic, &format!("group-{topic}"))
            .await
            .expect("consumer");
        Arc::new(Subscriber::new(consumer, format!("group-{topic}")))
    }

    #[tokio::test]
    async fn yields_messages_then_end_of_stream() {
        let broker = LocalBroker::new();
        let producer = broker.producer("s1").await.expect("producer");
        producer.send(b"key", b"hello").await.expect("send");
        broker.close_topic("s1");

        let subscriber = subscriber(&broker, "s1").await;
        let cancel = CancellationToken::new();
        match subscriber.read_next(&cancel).await {
            ReadOutcome::Message(message) => assert_eq!(&message.payload[..], b"hello"),
            other => panic!("expected message, got {other:?}"),
        }
        assert!(matches!(
            subscriber.read_next(&cancel).await,
            ReadOutcome::NoDataYet
        ));
    }

    #[tokio::test]
    async fn cancellation_interrupts_blocked_read() {
        let broker = LocalBroker::new();
        let subscriber = subscriber(&broker, "s2").await;
        let cancel = CancellationToken::new();

        let reader = {
            let subscriber = Arc::clone(&subscriber);
            let cancel = cancel.clone();
            tokio::spawn(async move { subscriber.read_next(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read returned promptly")
            .expect("join");
        assert!(matches!(outcome, ReadOutcome::Cancelled));
    }

    #[tokio::test]
    async fn close_wakes_blocked_read_and_releases_consumer() {
        let broker = LocalBroker::new();
        let subscriber = subscriber(&broker, "s3").await;
        let cancel = CancellationToken::new();

        let reader = {
            let subscriber = Arc::clone(&subscriber);
            tokio::spawn(async move { subscriber.read_next(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), subscriber.close())
            .await
            .expect("close does not wait on the read");
        let outcome = reader.await.expect("join");
        assert!(matches!(outcome, ReadOutcome::Fatal(BusError::Closed)));
        assert!(subscriber.is_closed());
        assert_eq!(broker.stats().consumers_closed, 1);
    }
}
