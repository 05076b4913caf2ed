use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::{Broker, BusError, BusMessage, BusResult, Consumer, Producer};

/// In-process broker keeping one append-only log per topic.
///
/// Consumer groups track their own offset and start from the beginning of the
/// log, so every record is handed to exactly one reader per group. Used by
/// tests and by local runs without a Kafka cluster.
#[derive(Clone, Default)]
pub struct LocalBroker {
    inner: Arc<LocalInner>,
}

#[derive(Default)]
struct LocalInner {
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
    connect_delay: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
    failing_sends: AtomicUsize,
    producers_created: AtomicUsize,
    producers_closed: AtomicUsize,
    consumers_created: AtomicUsize,
    consumers_closed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalBrokerStats {
    pub producers_created: usize,
    pub producers_closed: usize,
    pub consumers_created: usize,
    pub consumers_closed: usize,
}

struct TopicLog {
    state: Mutex<TopicState>,
    appended: watch::Sender<usize>,
}

#[derive(Default)]
struct TopicState {
    messages: Vec<BusMessage>,
    group_offsets: HashMap<String, usize>,
    closed: bool,
}

impl TopicLog {
    fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            state: Mutex::new(TopicState::default()),
            appended,
        }
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every producer/consumer construction, widening creation races.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.inner.connect_delay.lock() = Some(delay);
        self
    }

    /// While set, every connection attempt fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `count` sends on any topic fail with a transport error.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Ends the topic: readers drain what is left and then see end-of-stream.
    pub fn close_topic(&self, topic: &str) {
        let log = self.topic(topic);
        log.state.lock().closed = true;
        log.appended.send_modify(|_| {});
    }

    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        match self.inner.topics.lock().get(topic) {
            Some(log) => log.state.lock().messages.clone(),
            None => Vec::new(),
        }
    }

    pub fn stats(&self) -> LocalBrokerStats {
        LocalBrokerStats {
            producers_created: self.inner.producers_created.load(Ordering::SeqCst),
            producers_closed: self.inner.producers_closed.load(Ordering::SeqCst),
            consumers_created: self.inner.consumers_created.load(Ordering::SeqCst),
            consumers_closed: self.inner.consumers_closed.load(Ordering::SeqCst),
        }
    }

    fn topic(&self, topic: &str) -> Arc<TopicLog> {
        let mut guard = self.inner.topics.lock();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new()))
            .clone()
    }

    async fn connect(&self, topic: &str) -> BusResult<Arc<TopicLog>> {
        let delay = *self.inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable(format!(
                "local broker refused connection for topic {topic}"
            )));
        }
        Ok(self.topic(topic))
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn producer(&self, topic: &str) -> BusResult<Box<dyn Producer>> {
        let log = self.connect(topic).await?;
        self.inner.producers_created.fetch_add(1, Ordering::SeqCst);
        debug!(topic, "local producer connected");
        Ok(Box::new(LocalProducer {
            topic: topic.to_string(),
            log,
            broker: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consumer(&self, topic: &str, group_id: &str) -> BusResult<Box<dyn Consumer>> {
        let log = self.connect(topic).await?;
        self.inner.consumers_created.fetch_add(1, Ordering::SeqCst);
        debug!(topic, group_id, "local consumer connected");
        let appended = log.appended.subscribe();
        Ok(Box::new(LocalConsumer {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            log,
            appended,
            broker: Arc::clone(&self.inner),
            closed: false,
        }))
    }
}

struct LocalProducer {
    topic: String,
    log: Arc<TopicLog>,
    broker: Arc<LocalInner>,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for LocalProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, key: &[u8], payload: &[u8]) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let injected = self
            .broker
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Transport(format!(
                "injected send failure on topic {}",
                self.topic
            )));
        }

        let len = {
            let mut state = self.log.state.lock();
            if state.closed {
                return Err(BusError::Closed);
            }
            let offset = state.messages.len() as i64;
            state.messages.push(BusMessage {
                topic: self.topic.clone(),
                key: Some(Bytes::copy_from_slice(key)),
                payload: Bytes::copy_from_slice(payload),
                offset,
            });
            state.messages.len()
        };
        self.log.appended.send_replace(len);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.producers_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct LocalConsumer {
    topic: String,
    group_id: String,
    log: Arc<TopicLog>,
    appended: watch::Receiver<usize>,
    broker: Arc<LocalInner>,
    closed: bool,
}

impl LocalConsumer {
    fn take_next(&self) -> Option<Option<BusMessage>> {
        let mut state = self.log.state.lock();
        let offset = state
            .group_offsets
            .get(&self.group_id)
            .copied()
            .unwrap_or(0);
        if let Some(message) = state.messages.get(offset).cloned() {
            state.group_offsets.insert(self.group_id.clone(), offset + 1);
            return Some(Some(message));
        }
        if state.closed {
            return Some(None);
        }
        None
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv(&mut self) -> BusResult<Option<BusMessage>> {
        if self.closed {
            return Err(BusError::Closed);
        }
        loop {
            if let Some(next) = self.take_next() {
                return Ok(next);
            }
            if self.appended.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.broker.consumers_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
