use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bridge::Bridge,
    metrics,
    push::{PushRegistration, PushTarget, Superseded},
    session::SessionError,
    state::AppState,
    subscriber::Subscriber,
};

/// How long a new connection waits for a displaced bridge to hand the
/// subscriber back.
const HANDOVER_TIMEOUT: Duration = Duration::from_secs(5);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub fn group_id(stream_id: &str) -> String {
    format!("group-{stream_id}")
}

#[derive(Debug, Error)]
enum ClaimError {
    #[error("previous consumer for the stream is still shutting down")]
    HandoverTimedOut,
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Waits for a displaced bridge to give the subscriber back, then takes it.
/// `Ok(None)` means this connection was itself cancelled in the meantime.
async fn claim_subscriber(
    state: &AppState,
    stream_id: &str,
    superseded: Option<Superseded>,
    cancel: &CancellationToken,
    handover_timeout: Duration,
) -> Result<Option<Arc<Subscriber>>, ClaimError> {
    if let Some(previous) = superseded {
        if !previous.wait(handover_timeout).await {
            warn!(
                stream_id,
                previous_connection_id = %previous.connection_id(),
                "previous bridge still running after handover timeout"
            );
            return Err(ClaimError::HandoverTimedOut);
        }
    }
    if cancel.is_cancelled() {
        return Ok(None);
    }
    let subscriber = state
        .sessions
        .get_or_create_subscriber(stream_id, &group_id(stream_id))
        .await?;
    Ok(Some(subscriber))
}

/// Drives one results connection: claims the stream's push slot, starts the
/// bridge, and tears both down when the client goes away or is replaced.
pub async fn serve_results(socket: WebSocket, state: Arc<AppState>, stream_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (target, mut outbound) = PushTarget::channel(state.push_buffer);
    let PushRegistration {
        connection_id,
        cancel,
        stopped,
        superseded,
    } = state.push_targets.register(&stream_id, target.clone());
    metrics::record_push_connection();
    info!(stream_id = %stream_id, connection_id = %connection_id, "push connection opened");

    let writer_stream = stream_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        info!(
            stream_id = %writer_stream,
            connection_id = %connection_id,
            "writer task finished"
        );
    });

    let subscriber = match claim_subscriber(&state, &stream_id, superseded, &cancel, HANDOVER_TIMEOUT).await {
        Ok(subscriber) => subscriber,
        Err(err) => {
            warn!(stream_id = %stream_id, error = %err, "could not start consuming");
            let _ = target
                .send_text(format!("Error reading messages: {err}"))
                .await;
            None
        }
    };

    let bridge = match subscriber {
        Some(subscriber) => {
            let started = target
                .send_text(format!("Started consuming messages for stream {stream_id}"))
                .await;
            if started.is_ok() {
                let bridge = Bridge::new(
                    stream_id.clone(),
                    Arc::clone(&subscriber),
                    state.sessions.clone(),
                    state.push_targets.clone(),
                    Arc::clone(&state.transform),
                    cancel.clone(),
                );
                Some(bridge.spawn(stopped))
            } else {
                state.sessions.release_subscriber(&stream_id, &subscriber).await;
                drop(stopped);
                None
            }
        }
        None => {
            drop(stopped);
            None
        }
    };

    if bridge.is_some() {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(stream_id = %stream_id, connection_id = %connection_id, "push connection superseded or closed");
                    break;
                }
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Close(frame))) => {
                        info!(
                            stream_id = %stream_id,
                            connection_id = %connection_id,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(
                            stream_id = %stream_id,
                            connection_id = %connection_id,
                            error = %err,
                            "error receiving from websocket"
                        );
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    state.push_targets.unregister(&stream_id, connection_id);
    cancel.cancel();
    drop(target);

    let mut writer = writer;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(stream_id = %stream_id, connection_id = %connection_id, "push connection closed");
}
