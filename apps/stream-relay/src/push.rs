use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push connection {0} is closed")]
    Disconnected(Uuid),
}

/// Outbound half of one live push connection. Frames are queued for the
/// connection's socket writer.
#[derive(Debug, Clone)]
pub struct PushTarget {
    connection_id: Uuid,
    sender: mpsc::Sender<String>,
}

impl PushTarget {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        let target = Self {
            connection_id: Uuid::new_v4(),
            sender,
        };
        (target, receiver)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub async fn send_text(&self, text: String) -> Result<(), PushError> {
        self.sender
            .send(text)
            .await
            .map_err(|_| PushError::Disconnected(self.connection_id))
    }
}

struct PushSlot {
    target: PushTarget,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

/// What a connection receives when it claims a stream's push slot.
pub struct PushRegistration {
    pub connection_id: Uuid,
    /// Fired when this connection is replaced, unregistered or disconnected.
    pub cancel: CancellationToken,
    /// Dropping this marks the connection's bridge as fully stopped.
    pub stopped: DropGuard,
    /// Present when the registration displaced an earlier connection.
    pub superseded: Option<Superseded>,
}

/// Handle on a displaced connection, used to wait until its bridge has
/// released the stream's subscriber.
pub struct Superseded {
    connection_id: Uuid,
    stopped: CancellationToken,
}

impl Superseded {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Returns `false` if the previous bridge is still running after `timeout`.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.stopped.cancelled())
            .await
            .is_ok()
    }
}

/// At most one push connection per stream id. All mutations go through one
/// lock; a replaced connection has its cancellation fired before the new one
/// takes the slot.
#[derive(Clone, Default)]
pub struct PushTargetRegistry {
    slots: Arc<Mutex<HashMap<String, PushSlot>>>,
}

impl PushTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream_id: &str, target: PushTarget) -> PushRegistration {
        let connection_id = target.connection_id();
        let cancel = CancellationToken::new();
        let stopped = CancellationToken::new();

        let mut slots = self.slots.lock();
        let superseded = slots.remove(stream_id).map(|previous| {
            previous.cancel.cancel();
            info!(
                stream_id,
                connection_id = %connection_id,
                previous_connection_id = %previous.target.connection_id(),
                "push connection replaced"
            );
            Superseded {
                connection_id: previous.target.connection_id(),
                stopped: previous.stopped,
            }
        });
        slots.insert(
            stream_id.to_string(),
            PushSlot {
                target,
                cancel: cancel.clone(),
                stopped: stopped.clone(),
            },
        );
        drop(slots);

        debug!(stream_id, connection_id = %connection_id, "push connection registered");
        PushRegistration {
            connection_id,
            cancel,
            stopped: stopped.drop_guard(),
            superseded,
        }
    }

    /// Removes the stream's connection if it is still `connection_id`.
    pub fn unregister(&self, stream_id: &str, connection_id: Uuid) -> bool {
        let mut slots = self.slots.lock();
        let is_current = slots
            .get(stream_id)
            .is_some_and(|slot| slot.target.connection_id() == connection_id);
        if !is_current {
            return false;
        }
        if let Some(slot) = slots.remove(stream_id) {
            slot.cancel.cancel();
        }
        debug!(stream_id, connection_id = %connection_id, "push connection unregistered");
        true
    }

    /// Removes whatever connection the stream has.
    pub fn disconnect(&self, stream_id: &str) -> bool {
        let removed = self.slots.lock().remove(stream_id);
        match removed {
            Some(slot) => {
                slot.cancel.cancel();
                info!(
                    stream_id,
                    connection_id = %slot.target.connection_id(),
                    "push connection disconnected"
                );
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) -> usize {
        let drained: Vec<PushSlot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.cancel.cancel();
        }
        drained.len()
    }

    pub fn current(&self, stream_id: &str) -> Option<PushTarget> {
        self.slots
            .lock()
            .get(stream_id)
            .map(|slot| slot.target.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
