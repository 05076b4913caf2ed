use std::sync::Arc;

use stream_bus::BusError;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    metrics,
    push::{PushError, PushTargetRegistry},
    session::SessionRegistry,
    subscriber::{ReadOutcome, Subscriber},
    transform::Transform,
};

pub const NO_NEW_MESSAGES: &str = "No new messages available.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Consuming,
    Closed,
    Cancelled,
    Fatal,
}

#[derive(Debug)]
pub enum BridgeExit {
    /// The bus reported end of stream.
    Closed,
    Cancelled,
    SubscriberFailed(BusError),
    PushFailed(PushError),
}

impl BridgeExit {
    pub fn state(&self) -> BridgeState {
        match self {
            BridgeExit::Closed => BridgeState::Closed,
            BridgeExit::Cancelled => BridgeState::Cancelled,
            BridgeExit::SubscriberFailed(_) | BridgeExit::PushFailed(_) => BridgeState::Fatal,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            BridgeExit::Closed => "closed",
            BridgeExit::Cancelled => "cancelled",
            BridgeExit::SubscriberFailed(_) => "subscriber_failed",
            BridgeExit::PushFailed(_) => "push_failed",
        }
    }
}

/// Moves one stream's consumed messages to whichever push connection is
/// current for that stream.
///
/// The bridge never restarts itself. Whatever way it ends, its subscriber is
/// handed back to the session registry before the task finishes.
pub struct Bridge {
    stream_id: String,
    subscriber: Arc<Subscriber>,
    sessions: SessionRegistry,
    push_targets: PushTargetRegistry,
    transform: Arc<dyn Transform>,
    cancel: CancellationToken,
    state: BridgeState,
}

impl Bridge {
    pub fn new(
        stream_id: impl Into<String>,
        subscriber: Arc<Subscriber>,
        sessions: SessionRegistry,
        push_targets: PushTargetRegistry,
        transform: Arc<dyn Transform>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            subscriber,
            sessions,
            push_targets,
            transform,
            cancel,
            state: BridgeState::Idle,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Runs the bridge on its own task. `stopped` is released only after the
    /// subscriber has been returned.
    pub fn spawn(self, stopped: DropGuard) -> JoinHandle<BridgeExit> {
        let span = info_span!("bridge", stream_id = %self.stream_id);
        metrics::bridge_started();
        tokio::spawn(
            async move {
                let _stopped = stopped;
                self.run().await
            }
            .instrument(span),
        )
    }

    pub async fn run(mut self) -> BridgeExit {
        self.transition(BridgeState::Consuming);
        let exit = self.pump().await;
        self.transition(exit.state());

        self.sessions
            .release_subscriber(&self.stream_id, &self.subscriber)
            .await;
        metrics::bridge_stopped(exit.metric_label());
        match &exit {
            BridgeExit::Closed | BridgeExit::Cancelled => {
                info!(stream_id = %self.stream_id, exit = ?exit, "bridge finished")
            }
            BridgeExit::SubscriberFailed(_) | BridgeExit::PushFailed(_) => {
                warn!(stream_id = %self.stream_id, exit = ?exit, "bridge failed")
            }
        }
        exit
    }

    async fn pump(&self) -> BridgeExit {
        loop {
            match self.subscriber.read_next(&self.cancel).await {
                ReadOutcome::Message(message) => {
                    metrics::record_consumed();
                    let processed = self.transform.apply(&message.payload);
                    if let Err(exit) = self.forward(processed, message.offset).await {
                        return exit;
                    }
                }
                ReadOutcome::NoDataYet => {
                    self.notify(NO_NEW_MESSAGES.to_string()).await;
                    return BridgeExit::Closed;
                }
                ReadOutcome::Cancelled => return BridgeExit::Cancelled,
                ReadOutcome::Fatal(err) => {
                    self.notify(format!("Error reading messages: {err}")).await;
                    return BridgeExit::SubscriberFailed(err);
                }
            }
        }
    }

    async fn forward(&self, text: String, offset: i64) -> Result<(), BridgeExit> {
        let Some(target) = self.push_targets.current(&self.stream_id) else {
            metrics::record_dropped();
            debug!(stream_id = %self.stream_id, offset, "no push target, message dropped");
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BridgeExit::Cancelled),
            sent = target.send_text(text) => match sent {
                Ok(()) => {
                    debug!(
                        stream_id = %self.stream_id,
                        connection_id = %target.connection_id(),
                        offset,
                        "message pushed"
                    );
                    Ok(())
                }
                Err(err) => Err(BridgeExit::PushFailed(err)),
            },
        }
    }

    /// Best-effort informational frame; failures are only logged.
    ///
    /// The target is looked up before the cancellation check: a replacement
    /// fires this bridge's token before it claims the slot, so a displaced
    /// bridge never writes to its successor.
    async fn notify(&self, text: String) {
        let Some(target) = self.push_targets.current(&self.stream_id) else {
            return;
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            sent = target.send_text(text) => {
                if let Err(err) = sent {
                    debug!(stream_id = %self.stream_id, error = %err, "could not notify push target");
                }
            }
        }
    }

    fn transition(&mut self, next: BridgeState) {
        debug!(stream_id = %self.stream_id, from = ?self.state, to = ?next, "bridge state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        publisher::RetryPolicy,
        push::PushTarget,
        transform::ProcessedStamp,
    };
    use std::time::Duration;
    use stream_bus::{Broker, LocalBroker};
    use tokio::sync::mpsc;

    struct Harness {
        broker: LocalBroker,
        sessions: SessionRegistry,
        push_targets: PushTargetRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let broker = LocalBroker::new();
            let sessions = SessionRegistry::new(Arc::new(broker.clone()), RetryPolicy::default());
            Self {
                broker,
                sessions,
                push_targets: PushTargetRegistry::new(),
            }
        }

        async fn bridge(&self, stream_id: &str, cancel: CancellationToken) -> Bridge {
            let subscriber = self
                .sessions
                .get_or_create_subscriber(stream_id, &format!("group-{stream_id}"))
                .await
                .expect("subscriber");
            Bridge::new(
                stream_id,
                subscriber,
                self.sessions.clone(),
                self.push_targets.clone(),
                Arc::new(ProcessedStamp),
                cancel,
            )
        }

        async fn publish(&self, stream_id: &str, data: &str) {
            let producer = self.broker.producer(stream_id).await.expect("producer");
            producer.send(b"key", data.as_bytes()).await.expect("send");
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn forwards_in_read_order_until_cancelled() {
        let harness = Harness::new();
        let (target, mut rx) = PushTarget::channel(8);
        let registration = harness.push_targets.register("s", target);
        let bridge = harness.bridge("s", registration.cancel.clone()).await;
        assert_eq!(bridge.state(), BridgeState::Idle);
        let handle = bridge.spawn(registration.stopped);

        for data in ["one", "two", "three"] {
            harness.publish("s", data).await;
        }
        for data in ["one", "two", "three"] {
            let frame = next_frame(&mut rx).await;
            assert!(frame.starts_with(&format!("Processed: {data} at ")), "{frame}");
        }

        registration.cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("bridge stops promptly")
            .expect("join");
        assert!(matches!(exit, BridgeExit::Cancelled));
        assert_eq!(exit.state(), BridgeState::Cancelled);
        assert_eq!(harness.broker.stats().consumers_closed, 1);
    }

    #[tokio::test]
    async fn end_of_stream_notifies_and_closes() {
        let harness = Harness::new();
        let (target, mut rx) = PushTarget::channel(8);
        let registration = harness.push_targets.register("s", target);
        harness.publish("s", "last").await;
        harness.broker.close_topic("s");

        let exit = harness.bridge("s", registration.cancel.clone()).await.run().await;
        assert!(matches!(exit, BridgeExit::Closed));
        assert!(next_frame(&mut rx).await.contains("last"));
        assert_eq!(next_frame(&mut rx).await, NO_NEW_MESSAGES);
    }

    #[tokio::test]
    async fn push_failure_is_fatal_and_releases_subscriber() {
        let harness = Harness::new();
        let (target, rx) = PushTarget::channel(8);
        let registration = harness.push_targets.register("s", target);
        drop(rx);
        harness.publish("s", "nobody listening").await;

        let exit = harness.bridge("s", registration.cancel.clone()).await.run().await;
        assert!(matches!(exit, BridgeExit::PushFailed(_)));
        assert_eq!(exit.state(), BridgeState::Fatal);
        assert_eq!(harness.broker.stats().consumers_closed, 1);
    }

    #[tokio::test]
    async fn closed_subscriber_reports_error_frame() {
        let harness = Harness::new();
        let (target, mut rx) = PushTarget::channel(8);
        let registration = harness.push_targets.register("s", target);
        let bridge = harness.bridge("s", registration.cancel.clone()).await;
        let handle = bridge.spawn(registration.stopped);

        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.sessions.close_session("s").await;

        let frame = next_frame(&mut rx).await;
        assert!(frame.starts_with("Error reading messages: "), "{frame}");
        let exit = handle.await.expect("join");
        assert!(matches!(exit, BridgeExit::SubscriberFailed(BusError::Closed)));
    }

    #[tokio::test]
    async fn displaced_bridge_sends_nothing_to_its_successor() {
        let harness = Harness::new();
        let (first, _first_rx) = PushTarget::channel(8);
        let first_reg = harness.push_targets.register("s", first);
        let bridge = harness.bridge("s", first_reg.cancel.clone()).await;

        let (second, mut second_rx) = PushTarget::channel(8);
        let _second_reg = harness.push_targets.register("s", second);

        bridge.notify(NO_NEW_MESSAGES.to_string()).await;
        bridge
            .notify("Error reading messages: bus channel closed".to_string())
            .await;
        assert!(second_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn messages_without_a_target_are_dropped() {
        let harness = Harness::new();
        let cancel = CancellationToken::new();
        let bridge = harness.bridge("s", cancel.clone()).await;
        let handle = bridge.spawn(CancellationToken::new().drop_guard());

        harness.publish("s", "missed").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (target, mut rx) = PushTarget::channel(8);
        let _registration = harness.push_targets.register("s", target);
        harness.publish("s", "seen").await;

        let frame = next_frame(&mut rx).await;
        assert!(frame.contains("seen"), "{frame}");
        cancel.cancel();
        handle.await.expect("join");
    }
}
