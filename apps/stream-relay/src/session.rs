use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use stream_bus::{Broker, BusError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    metrics,
    publisher::{Publisher, RetryPolicy},
    subscriber::Subscriber,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stream id must not be empty")]
    EmptyStreamId,
    #[error("bus resources unavailable for stream {stream_id}: {source}")]
    ResourceUnavailable {
        stream_id: String,
        #[source]
        source: BusError,
    },
}

/// Per-stream bus resources, created on first use and reused until the
/// stream is closed.
///
/// Creation for one stream id runs under that stream's lock, so concurrent
/// callers racing on a new id all receive the single instance built by the
/// first one.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    sessions: DashMap<String, Arc<SessionSlot>>,
}

#[derive(Default)]
struct SessionSlot {
    resources: Mutex<SessionResources>,
}

#[derive(Default)]
struct SessionResources {
    publisher: Option<Arc<Publisher>>,
    subscriber: Option<Arc<Subscriber>>,
    closed: bool,
}

impl SessionRegistry {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                broker,
                retry,
                sessions: DashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.inner.sessions.contains_key(stream_id)
    }

    pub async fn get_or_create_publisher(
        &self,
        stream_id: &str,
    ) -> Result<Arc<Publisher>, SessionError> {
        ensure_stream_id(stream_id)?;
        loop {
            let slot = self.slot(stream_id);
            let mut resources = slot.resources.lock().await;
            if resources.closed {
                continue;
            }
            if let Some(publisher) = &resources.publisher {
                debug!(stream_id, "reusing publisher");
                return Ok(Arc::clone(publisher));
            }

            let producer = match self.inner.broker.producer(stream_id).await {
                Ok(producer) => producer,
                Err(source) => {
                    warn!(stream_id, error = %source, "failed to create publisher");
                    self.evict_if_empty(stream_id, &slot, &mut resources);
                    return Err(SessionError::ResourceUnavailable {
                        stream_id: stream_id.to_string(),
                        source,
                    });
                }
            };
            let publisher = Arc::new(Publisher::new(producer, self.inner.retry));
            resources.publisher = Some(Arc::clone(&publisher));
            info!(stream_id, "publisher created");
            return Ok(publisher);
        }
    }

    pub async fn get_or_create_subscriber(
        &self,
        stream_id: &str,
        group_id: &str,
    ) -> Result<Arc<Subscriber>, SessionError> {
        ensure_stream_id(stream_id)?;
        loop {
            let slot = self.slot(stream_id);
            let mut resources = slot.resources.lock().await;
            if resources.closed {
                continue;
            }
            if let Some(subscriber) = &resources.subscriber {
                debug!(stream_id, "reusing subscriber");
                return Ok(Arc::clone(subscriber));
            }

            let consumer = match self.inner.broker.consumer(stream_id, group_id).await {
                Ok(consumer) => consumer,
                Err(source) => {
                    warn!(stream_id, group_id, error = %source, "failed to create subscriber");
                    self.evict_if_empty(stream_id, &slot, &mut resources);
                    return Err(SessionError::ResourceUnavailable {
                        stream_id: stream_id.to_string(),
                        source,
                    });
                }
            };
            let subscriber = Arc::new(Subscriber::new(consumer, group_id));
            resources.subscriber = Some(Arc::clone(&subscriber));
            info!(stream_id, group_id, "subscriber created");
            return Ok(subscriber);
        }
    }

    /// Drops the stream's subscriber if `subscriber` is still the registered
    /// one, then closes it. The publisher is left alone; a stream left with
    /// neither resource is forgotten.
    pub async fn release_subscriber(&self, stream_id: &str, subscriber: &Arc<Subscriber>) {
        let slot = self
            .inner
            .sessions
            .get(stream_id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(slot) = slot {
            let mut resources = slot.resources.lock().await;
            let current = resources
                .subscriber
                .as_ref()
                .is_some_and(|registered| Arc::ptr_eq(registered, subscriber));
            if current {
                resources.subscriber = None;
                self.evict_if_empty(stream_id, &slot, &mut resources);
            }
        }
        subscriber.close().await;
        debug!(stream_id, "subscriber released");
    }

    /// Closes both resources of a stream. Returns `false` when the stream was
    /// not registered, which makes repeated calls harmless.
    pub async fn close_session(&self, stream_id: &str) -> bool {
        let Some((_, slot)) = self.inner.sessions.remove(stream_id) else {
            return false;
        };
        metrics::set_active_sessions(self.inner.sessions.len());

        let (publisher, subscriber) = {
            let mut resources = slot.resources.lock().await;
            resources.closed = true;
            (resources.publisher.take(), resources.subscriber.take())
        };
        if let Some(subscriber) = subscriber {
            subscriber.close().await;
        }
        if let Some(publisher) = publisher {
            publisher.close().await;
        }
        info!(stream_id, "stream session closed");
        true
    }

    pub async fn shutdown(&self) {
        let stream_ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for stream_id in &stream_ids {
            self.close_session(stream_id).await;
        }
        info!(closed = stream_ids.len(), "session registry shut down");
    }

    fn slot(&self, stream_id: &str) -> Arc<SessionSlot> {
        let (slot, inserted) = match self.inner.sessions.entry(stream_id.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let slot = Arc::new(SessionSlot::default());
                entry.insert(Arc::clone(&slot));
                (slot, true)
            }
        };
        // Counted after the shard guard is gone; `len` locks every shard.
        if inserted {
            metrics::set_active_sessions(self.inner.sessions.len());
        }
        slot
    }

    /// Removes `slot` from the map when it owns nothing. Must be called with
    /// the slot's lock held; marking it closed sends any caller already
    /// waiting on that lock back to `slot()` for a fresh entry.
    fn evict_if_empty(
        &self,
        stream_id: &str,
        slot: &Arc<SessionSlot>,
        resources: &mut SessionResources,
    ) {
        if resources.publisher.is_some() || resources.subscriber.is_some() {
            return;
        }
        resources.closed = true;
        let removed = self
            .inner
            .sessions
            .remove_if(stream_id, |_, registered| Arc::ptr_eq(registered, slot))
            .is_some();
        if removed {
            metrics::set_active_sessions(self.inner.sessions.len());
            debug!(stream_id, "empty stream session dropped");
        }
    }
}

fn ensure_stream_id(stream_id: &str) -> Result<(), SessionError> {
    if stream_id.trim().is_empty() {
        return Err(SessionError::EmptyStreamId);
    }
    Ok(())
}
