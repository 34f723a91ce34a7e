//! Subscriber Connections
//!
//! The registry-side view of one live subscriber: an id, a lifecycle state
//! and the sending half of its bounded outbound queue.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{DeliveryError, Event};

// ─────────────────────────────────────────────────────────────────────────────
// Connection Id
// ─────────────────────────────────────────────────────────────────────────────

/// Unique identifier of a connection, assigned in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a subscriber connection
///
/// States are ordered and only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting = 0,
    /// Registered and receiving events
    Open = 1,
    /// Teardown requested, pending work is being abandoned
    Closing = 2,
    /// Terminal
    Closed = 3,
}

impl ConnectionState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a connection is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed or the stream ended
    ClientClosed,
    /// Reading or writing the transport failed
    TransportError,
    /// The outbound queue overflowed under the disconnect policy
    Overflow,
    /// The service is shutting down
    Shutdown,
}

impl CloseReason {
    /// Websocket close code sent to the client, if a close frame is sent at all
    pub fn close_code(&self) -> Option<u16> {
        match self {
            CloseReason::Overflow => Some(1008),
            CloseReason::Shutdown => Some(1001),
            CloseReason::ClientClosed | CloseReason::TransportError => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::TransportError => "transport error",
            CloseReason::Overflow => "outbound queue overflow",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// A live subscriber as seen by the registry and the dispatcher
///
/// The transport itself is owned by the subscriber session; this handle only
/// carries the outbound queue and a way to ask the session to close.
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<Event>>,
    state: AtomicU8,
    close_requested: Notify,
    close_reason: Mutex<Option<CloseReason>>,
}

impl Connection {
    /// Create a connection in the `Connecting` state
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<Event>>) -> Self {
        Self {
            id,
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_requested: Notify::new(),
            close_reason: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Check if the connection accepts deliveries
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Move the state forward, returning the previous state
    fn advance(&self, to: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.fetch_max(to as u8, Ordering::SeqCst))
    }

    /// Mark the connection open; a no-op once closing has started
    pub fn open(&self) -> bool {
        self.advance(ConnectionState::Open) == ConnectionState::Connecting
    }

    /// Push an event onto the outbound queue without waiting
    pub fn try_deliver(&self, event: Arc<Event>) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::Closed(self.id));
        }

        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.id),
        })
    }

    /// Request teardown
    ///
    /// Returns `true` if this call started the teardown. The first reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        // Held across the transition so a waiter that sees `Closing` also sees the reason
        let mut slot = self.close_reason.lock();
        let previous = self.advance(ConnectionState::Closing);
        if previous >= ConnectionState::Closing {
            return false;
        }

        *slot = Some(reason);
        drop(slot);
        self.close_requested.notify_waiters();
        true
    }

    /// Wait until teardown has been requested
    ///
    /// Any number of tasks may wait at once.
    pub async fn close_requested(&self) {
        let notified = self.close_requested.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.state() >= ConnectionState::Closing {
            return;
        }
        notified.await;
    }

    /// The reason passed to the first `close` call
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Enter the terminal state
    pub fn mark_closed(&self) {
        self.advance(ConnectionState::Closed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
