//! Subscriber Session
//!
//! Drives one websocket connection. The write half drains the connection's
//! outbound queue; the read half relays client messages according to the
//! configured [`RelayMode`]. The two halves run as separate tasks so neither
//! direction can stall the other.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinError;

use super::state::AppState;
use crate::fanout::{
    CloseReason, Connection, DeliveryError, Event, OverflowPolicy, PayloadKind, RelayMode,
    SessionError,
};

/// How long the write half may spend flushing a close frame
const WRITER_GRACE: Duration = Duration::from_secs(1);

type SessionResult = Result<(), SessionError>;

/// Handle a subscriber websocket connection until it closes
pub async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (ws_sender, ws_receiver) = socket.split();

    // Bounded outbound queue for this subscriber
    let (tx, rx) = mpsc::channel::<Arc<Event>>(state.config().queue_capacity);

    // Register and enter OPEN
    let connection = state.registry().register(tx);
    let id = connection.id();

    let mut send_task = tokio::spawn(write_loop(ws_sender, rx, Arc::clone(&connection)));
    let mut recv_task = tokio::spawn(read_loop(ws_receiver, state.clone(), Arc::clone(&connection)));

    let outcome = tokio::select! {
        res = &mut send_task => {
            recv_task.abort();
            res
        }
        res = &mut recv_task => {
            // Let the writer observe the close request and flush a close frame
            connection.close(CloseReason::ClientClosed);
            if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
                send_task.abort();
            }
            res
        }
    };

    // CLOSING: make sure teardown is recorded, then leave the registry
    connection.close(CloseReason::TransportError);
    state.registry().unregister(id);
    connection.mark_closed();

    log_outcome(&connection, outcome);
}

fn log_outcome(connection: &Connection, outcome: Result<SessionResult, JoinError>) {
    let reason = connection.close_reason().map(|r| r.as_str()).unwrap_or("unknown");

    match outcome {
        Ok(Ok(())) => {
            tracing::debug!(connection = %connection.id(), reason, "Subscriber session closed");
        }
        Ok(Err(e)) => {
            tracing::warn!(connection = %connection.id(), reason, error = %e, "Subscriber session failed");
        }
        Err(e) if e.is_cancelled() => {
            tracing::debug!(connection = %connection.id(), reason, "Subscriber session cancelled");
        }
        Err(e) => {
            tracing::error!(connection = %connection.id(), error = ?e, "Subscriber session task panicked");
        }
    }
}

/// Forward queued events to the client until the connection is asked to close
///
/// A close request interrupts a write the client is not draining; the pending
/// frame is abandoned and the sink dropped.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<Event>>,
    connection: Arc<Connection>,
) -> SessionResult {
    loop {
        let event = tokio::select! {
            biased;

            _ = connection.close_requested() => break,

            event = rx.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };

        tokio::select! {
            biased;

            _ = connection.close_requested() => break,

            res = ws_sender.send(event.to_message()) => {
                if let Err(e) = res {
                    connection.close(CloseReason::TransportError);
                    return Err(SessionError::Transport(e));
                }
            }
        }
    }

    send_close_frame(&mut ws_sender, &connection).await;
    Ok(())
}

/// Best-effort close frame for reasons that carry a close code
async fn send_close_frame(ws_sender: &mut SplitSink<WebSocket, Message>, connection: &Connection) {
    let Some(reason) = connection.close_reason() else {
        return;
    };
    let Some(code) = reason.close_code() else {
        return;
    };

    let frame = CloseFrame {
        code,
        reason: reason.as_str().into(),
    };
    let send = ws_sender.send(Message::Close(Some(frame)));
    if tokio::time::timeout(WRITER_GRACE, send).await.is_err() {
        tracing::debug!(connection = %connection.id(), "Client not reading, skipping close frame");
    }
}

/// Read client messages and relay them
async fn read_loop(
    mut ws_receiver: SplitStream<WebSocket>,
    state: AppState,
    connection: Arc<Connection>,
) -> SessionResult {
    let id = connection.id();

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                connection.close(CloseReason::TransportError);
                return Err(SessionError::Transport(e));
            }
        };

        let event = match msg {
            Message::Text(text) => Event::from_subscriber(id, Bytes::from(text), PayloadKind::Text),
            Message::Binary(data) => {
                Event::from_subscriber(id, Bytes::from(data), PayloadKind::Binary)
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                // Pong is handled automatically by axum
                tracing::trace!(connection = %id, "Keep-alive frame");
                continue;
            }
        };

        relay_client_message(&state, &connection, event)?;
    }

    connection.close(CloseReason::ClientClosed);
    Ok(())
}

/// Relay one client message according to the configured mode
fn relay_client_message(
    state: &AppState,
    connection: &Arc<Connection>,
    event: Event,
) -> SessionResult {
    let exclude = match state.config().relay_mode {
        RelayMode::Echo => return echo(state, connection, event),
        RelayMode::Broadcast => None,
        RelayMode::BroadcastOthers => Some(connection.id()),
    };

    if let Err(e) = state.dispatcher().submit_except(event, exclude) {
        tracing::warn!(connection = %connection.id(), error = %e, "Dropping client message");
    }
    Ok(())
}

/// Queue a client message back onto the sender's own outbound queue
fn echo(state: &AppState, connection: &Arc<Connection>, event: Event) -> SessionResult {
    match connection.try_deliver(Arc::new(event)) {
        Ok(()) => Ok(()),
        Err(DeliveryError::QueueFull(id))
            if state.config().overflow_policy == OverflowPolicy::DropNewest =>
        {
            tracing::warn!(connection = %id, "Outbound queue full, dropping echo");
            Ok(())
        }
        Err(err @ DeliveryError::QueueFull(_)) => {
            connection.close(CloseReason::Overflow);
            state.registry().unregister(connection.id());
            Err(err.into())
        }
        Err(err @ DeliveryError::Closed(_)) => Err(err.into()),
    }
}
