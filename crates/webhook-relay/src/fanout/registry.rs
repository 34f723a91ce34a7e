//! Connection Registry
//!
//! Tracks the live set of subscriber connections.
//!
//! Membership is a copy-on-write map behind a short-lived lock: `snapshot`
//! only clones an `Arc`, so delivery iterates a frozen view while
//! `register`/`unregister` keep working against the next version.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::{CloseReason, Connection, ConnectionId, Event};

type Members = BTreeMap<ConnectionId, Arc<Connection>>;

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// The live set of subscriber connections
pub struct Registry {
    members: RwLock<Arc<Members>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            members: RwLock::new(Arc::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create an empty registry wrapped in an Arc
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a connection backed by the given outbound queue
    ///
    /// The connection is assigned a fresh id and is `Open` on return.
    pub fn register(&self, tx: mpsc::Sender<Arc<Event>>) -> Arc<Connection> {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(Connection::new(id, tx));
        connection.open();

        let mut members = self.members.write();
        Arc::make_mut(&mut *members).insert(id, Arc::clone(&connection));
        let count = members.len();
        drop(members);

        tracing::info!(connection = %id, subscribers = count, "Subscriber registered");
        connection
    }

    /// Remove a connection
    ///
    /// Idempotent: removing an id that is not present does nothing.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut members = self.members.write();
        if !members.contains_key(&id) {
            return None;
        }

        let removed = Arc::make_mut(&mut *members).remove(&id);
        let count = members.len();
        drop(members);

        tracing::info!(connection = %id, subscribers = count, "Subscriber unregistered");
        removed
    }

    /// Point-in-time view of the registered connections, in registration order
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(Arc::clone(&self.members.read()))
    }

    /// Look up a connection by id
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.members.read().get(&id).cloned()
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Ask every connection to close and clear membership
    ///
    /// Returns how many connections were closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let drained = std::mem::take(&mut *self.members.write());

        for connection in drained.values() {
            connection.close(reason);
        }

        tracing::info!(count = drained.len(), reason = reason.as_str(), "Closed all subscribers");
        drained.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// A frozen view of registry membership
#[derive(Clone)]
pub struct Snapshot(Arc<Members>);

impl Snapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.0.contains_key(&id)
    }

    /// Connections in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.0.values()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.0.keys().copied().collect()
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
