//! Fan-out Core
//!
//! The in-memory machinery that takes one event and delivers it to every
//! live subscriber connection.
//!
//! # Flow
//!
//! - Ingress (or a subscriber) submits an [`Event`] to the [`DispatcherHandle`]
//! - The dispatcher task takes a [`Registry`] snapshot
//! - Each [`Connection`] in the snapshot gets the event pushed onto its own
//!   bounded queue, never waiting on any other connection
//!
//! Delivery is best-effort and at-most-once per connection.

mod connection;
mod dispatcher;
mod event;
mod registry;

pub use connection::*;
pub use dispatcher::*;
pub use event::*;
pub use registry::*;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Why an event did not reach a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full for {0}")]
    QueueFull(ConnectionId),

    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

impl DeliveryError {
    /// The connection the failure belongs to
    pub fn connection(&self) -> ConnectionId {
        match self {
            DeliveryError::QueueFull(id) | DeliveryError::Closed(id) => *id,
        }
    }
}

/// Why an event could not be handed to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("dispatch queue is full")]
    QueueFull,

    #[error("dispatcher has stopped")]
    Stopped,
}

/// Why a subscriber session ended abnormally
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Policies
// ─────────────────────────────────────────────────────────────────────────────

/// What happens to a client message read by a session
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum RelayMode {
    /// Send the message back to the client that sent it
    #[default]
    Echo,
    /// Fan the message out to every subscriber, sender included
    Broadcast,
    /// Fan the message out to every subscriber except the sender
    BroadcastOthers,
}

/// What happens when a connection's outbound queue is full
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Close the connection and remove it from the registry
    #[default]
    Disconnect,
    /// Drop the event for that connection only and keep it open
    DropNewest,
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayMode::Echo => write!(f, "echo"),
            RelayMode::Broadcast => write!(f, "broadcast"),
            RelayMode::BroadcastOthers => write!(f, "broadcast-others"),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::Disconnect => write!(f, "disconnect"),
            OverflowPolicy::DropNewest => write!(f, "drop-newest"),
        }
    }
}
