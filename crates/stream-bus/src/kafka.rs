use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    config::ClientConfig,
    consumer::{Consumer as _, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::Message as _,
    producer::{FutureProducer, FutureRecord, Producer as _},
    util::Timeout,
};
use tracing::{debug, info, warn};

use crate::{Broker, BusError, BusMessage, BusResult, Consumer, Producer};

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Comma separated `host:port` list.
    pub brokers: String,
    pub operation_timeout: Duration,
    pub partitions: i32,
    pub replication: i32,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            operation_timeout: Duration::from_secs(5),
            partitions: 1,
            replication: 1,
        }
    }
}

/// Kafka-backed broker. Every producer or consumer first makes sure the
/// topic exists; a cluster that cannot answer the admin request in time is
/// reported as unavailable.
pub struct KafkaBroker {
    settings: KafkaSettings,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaBroker {
    pub fn connect(settings: KafkaSettings) -> BusResult<Self> {
        let admin = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .create::<AdminClient<DefaultClientContext>>()
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        info!(brokers = %settings.brokers, "kafka admin client created");
        Ok(Self { settings, admin })
    }

    async fn ensure_topic(&self, topic: &str) -> BusResult<()> {
        let new_topic = NewTopic::new(
            topic,
            self.settings.partitions,
            TopicReplication::Fixed(self.settings.replication),
        );
        let options = AdminOptions::new()
            .operation_timeout(Some(Timeout::After(self.settings.operation_timeout)));
        let results = self
            .admin
            .create_topics([&new_topic], &options)
            .await
            .map_err(|err| {
                warn!(topic, brokers = %self.settings.brokers, error = %err, "failed to reach kafka");
                BusError::Unavailable(err.to_string())
            })?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "created kafka topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "kafka topic already exists")
                }
                Err((name, code)) => {
                    warn!(topic = %name, error = %code, "could not create kafka topic")
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn producer(&self, topic: &str) -> BusResult<Box<dyn Producer>> {
        self.ensure_topic(topic).await?;
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set(
                "message.timeout.ms",
                self.settings.operation_timeout.as_millis().to_string(),
            )
            .create::<FutureProducer>()
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        info!(topic, "kafka producer initialised");
        Ok(Box::new(KafkaProducer {
            topic: topic.to_string(),
            producer,
            timeout: self.settings.operation_timeout,
        }))
    }

    async fn consumer(&self, topic: &str, group_id: &str) -> BusResult<Box<dyn Consumer>> {
        self.ensure_topic(topic).await?;
        let consumer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false")
            .create::<StreamConsumer>()
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        info!(topic, group_id, "kafka consumer initialised");
        Ok(Box::new(KafkaConsumer {
            topic: topic.to_string(),
            consumer: Some(consumer),
        }))
    }
}

struct KafkaProducer {
    topic: String,
    producer: FutureProducer,
    timeout: Duration,
}

#[async_trait]
impl Producer for KafkaProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, key: &[u8], payload: &[u8]) -> BusResult<()> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);
        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(err, _)| BusError::Transport(err.to_string()))
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
        if let Ok(Err(err)) = flushed {
            warn!(topic = %self.topic, error = %err, "kafka producer flush failed on close");
        }
    }
}

struct KafkaConsumer {
    topic: String,
    consumer: Option<StreamConsumer>,
}

#[async_trait]
impl Consumer for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv(&mut self) -> BusResult<Option<BusMessage>> {
        let Some(consumer) = self.consumer.as_ref() else {
            return Err(BusError::Closed);
        };
        match consumer.recv().await {
            Ok(message) => Ok(Some(BusMessage {
                topic: message.topic().to_string(),
                key: message.key().map(Bytes::copy_from_slice),
                payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                offset: message.offset(),
            })),
            Err(KafkaError::PartitionEOF(_)) => Ok(None),
            Err(err) => Err(BusError::Transport(err.to_string())),
        }
    }

    async fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            debug!(topic = %self.topic, "kafka consumer closed");
        }
    }
}
