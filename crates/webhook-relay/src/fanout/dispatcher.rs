//! Broadcast Dispatcher
//!
//! Delivers each event to every connection in a registry snapshot.
//!
//! Events are submitted through a [`DispatcherHandle`] onto a bounded queue
//! that a single task drains, so the submission order is the fan-out order
//! and, through each connection's FIFO queue, the order every subscriber
//! observes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    CloseReason, Connection, ConnectionId, DeliveryError, Event, OverflowPolicy, Registry,
    SubmitError,
};

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast Report
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the event was addressed to
    pub recipients: usize,

    /// Connections whose queue accepted the event
    pub delivered: usize,

    /// Deliveries that failed, one entry per affected connection
    pub failures: Vec<DeliveryError>,

    /// Connections that were closed and unregistered as a result
    pub reaped: Vec<ConnectionId>,
}

impl BroadcastReport {
    /// Check if every recipient got the event
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Fans events out to registered connections
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    overflow: OverflowPolicy,
}

impl Dispatcher {
    /// Create a dispatcher over a registry
    pub fn new(registry: Arc<Registry>, overflow: OverflowPolicy) -> Self {
        Self { registry, overflow }
    }

    /// Deliver an event to every registered connection
    pub fn broadcast(&self, event: &Arc<Event>) -> BroadcastReport {
        self.broadcast_except(event, None)
    }

    /// Deliver an event to every registered connection except `exclude`
    ///
    /// Never waits on a connection: each one either accepts the event onto
    /// its queue immediately or is handled by the overflow policy.
    pub fn broadcast_except(
        &self,
        event: &Arc<Event>,
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        let snapshot = self.registry.snapshot();
        let mut report = BroadcastReport::default();

        for connection in snapshot.iter() {
            if Some(connection.id()) == exclude {
                continue;
            }
            report.recipients += 1;

            match connection.try_deliver(Arc::clone(event)) {
                Ok(()) => report.delivered += 1,
                Err(err @ DeliveryError::QueueFull(_)) => {
                    if self.overflow == OverflowPolicy::Disconnect {
                        self.reap(connection, CloseReason::Overflow);
                        report.reaped.push(connection.id());
                    }
                    report.failures.push(err);
                }
                Err(err @ DeliveryError::Closed(_)) => {
                    self.reap(connection, CloseReason::TransportError);
                    report.reaped.push(connection.id());
                    report.failures.push(err);
                }
            }
        }

        report
    }

    /// Close a connection and drop it from the registry
    fn reap(&self, connection: &Arc<Connection>, reason: CloseReason) {
        if connection.close(reason) {
            tracing::warn!(
                connection = %connection.id(),
                reason = reason.as_str(),
                "Disconnecting subscriber"
            );
        }
        self.registry.unregister(connection.id());
    }

    /// Spawn the dispatch task
    ///
    /// The task runs until every [`DispatcherHandle`] is dropped, after
    /// draining what was already submitted.
    pub fn spawn(self, capacity: usize) -> (DispatcherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let join_handle = tokio::spawn(self.run(rx));
        (DispatcherHandle { tx }, join_handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<Dispatch>) {
        tracing::debug!(overflow = %self.overflow, "Dispatcher started");

        while let Some(dispatch) = rx.recv().await {
            let report = self.broadcast_except(&dispatch.event, dispatch.exclude);

            if report.is_complete() {
                tracing::debug!(
                    event_id = %dispatch.event.id,
                    delivered = report.delivered,
                    "Event dispatched"
                );
            } else {
                tracing::warn!(
                    event_id = %dispatch.event.id,
                    delivered = report.delivered,
                    failed = report.failures.len(),
                    reaped = report.reaped.len(),
                    "Event dispatched with failures"
                );
            }
        }

        tracing::debug!("Dispatcher stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher Handle
// ─────────────────────────────────────────────────────────────────────────────

/// A queued fan-out request
struct Dispatch {
    event: Arc<Event>,
    exclude: Option<ConnectionId>,
}

/// Cloneable handle for submitting events to the dispatch task
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Dispatch>,
}

impl DispatcherHandle {
    /// Queue an event for delivery to every subscriber
    ///
    /// Returns as soon as the event is queued; delivery happens on the
    /// dispatch task.
    pub fn submit(&self, event: Event) -> Result<Uuid, SubmitError> {
        self.submit_except(event, None)
    }

    /// Queue an event for every subscriber except `exclude`
    pub fn submit_except(
        &self,
        event: Event,
        exclude: Option<ConnectionId>,
    ) -> Result<Uuid, SubmitError> {
        let id = event.id;
        let dispatch = Dispatch {
            event: Arc::new(event),
            exclude,
        };

        self.tx.try_send(dispatch).map(|_| id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Stopped,
        })
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::ConnectionState;
    use std::time::Duration;

    fn subscriber(
        registry: &Registry,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (registry.register(tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<Event>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(String::from_utf8(event.payload.to_vec()).unwrap());
        }
        out
    }

    #[test]
    fn test_every_connection_gets_one_copy() {
        let registry = Registry::new_shared();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), OverflowPolicy::Disconnect);

        let mut receivers: Vec<_> = (0..5).map(|_| subscriber(&registry, 8).1).collect();

        let report = dispatcher.broadcast(&Arc::new(Event::text("E")));
        assert_eq!(report.recipients, 5);
        assert_eq!(report.delivered, 5);
        assert!(report.is_complete());

        for rx in &mut receivers {
            assert_eq!(drain(rx), vec!["E"]);
        }
    }

    #[test]
    fn test_broken_connection_is_isolated_and_reaped() {
        let registry = Registry::new_shared();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), OverflowPolicy::Disconnect);

        let (_a, mut rx_a) = subscriber(&registry, 8);
        let (b, rx_b) = subscriber(&registry, 8);
        let (_c, mut rx_c) = subscriber(&registry, 8);

        // Simulate a write failure: the session side of b is gone
        drop(rx_b);

        let report = dispatcher.broadcast(&Arc::new(Event::text("E")));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures, vec![DeliveryError::Closed(b.id())]);
        assert_eq!(report.reaped, vec![b.id()]);

        assert!(registry.get(b.id()).is_none());
        assert_eq!(b.state(), ConnectionState::Closing);
        assert_eq!(drain(&mut rx_a), vec!["E"]);
        assert_eq!(drain(&mut rx_c), vec!["E"]);
    }

    #[test]
    fn test_order_is_preserved_per_connection() {
        let registry = Registry::new_shared();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), OverflowPolicy::Disconnect);
        let (_a, mut rx) = subscriber(&registry, 8);

        dispatcher.broadcast(&Arc::new(Event::text("E1")));
        dispatcher.broadcast(&Arc::new(Event::text("E2")));

        assert_eq!(drain(&mut rx), vec!["E1", "E2"]);
    }

    #[test]
    fn test_overflow_disconnect_policy() {
        let registry = Registry::new_shared();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), OverflowPolicy::Disconnect);

        let (slow, _slow_rx) = subscriber(&registry, 2);
        let (_healthy, mut healthy_rx) = subscriber(&registry, 8);

        for n in 1..=3 {
            dispatcher.broadcast(&Arc::new(Event::text(format!("E{n}"))));
        }

        assert_eq!(slow.close_reason(), Some(CloseReason::Overflow));
        assert!(registry.get(slow.id()).is_none());

        dispatcher.broadcast(&Arc::new(Event::text("E4")));
        assert_eq!(drain(&mut healthy_rx), vec!["E1", "E2", "E3", "E4"]);
    }

    #[test]
    fn test_overflow_drop_newest_policy() {
        let registry = Registry::new_shared();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), OverflowPolicy::DropNewest);

        let (slow, mut slow_rx) = subscriber(&registry, 1);

        dispatcher.broadcast(&Arc::new(Event::text("E1")));
        let report = dispatcher.broadcast(&Arc::new(Event::text("E2")));

        assert_eq!(report.failures, vec![DeliveryError::QueueFull(slow.id())]);
        assert!(report.reaped.is_empty());
        assert!(slow.is_open());

        assert_eq!(drain(&mut slow_rx), vec!["E1"]);
        dispatcher.broadcast(&Arc::new(Event::text("E3")));
        assert_eq!(drain(&mut slow_rx), vec!["E3"]);
    }

    #[test]
    fn test_broadcast_except_skips_sender() {
        let registry = Registry::new_shared();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), OverflowPolicy::Disconnect);

        let (a, mut rx_a) = subscriber(&registry, 8);
        let (_b, mut rx_b) = subscriber(&registry, 8);

        let report = dispatcher.broadcast_except(&Arc::new(Event::text("ping")), Some(a.id()));
        assert_eq!(report.recipients, 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec!["ping"]);
    }

    #[test]
    fn test_broadcast_with_no_subscribers() {
        let dispatcher = Dispatcher::new(Registry::new_shared(), OverflowPolicy::Disconnect);
        let report = dispatcher.broadcast(&Arc::new(Event::text("E")));
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_spawned_dispatcher_preserves_submission_order() {
        let registry = Registry::new_shared();
        let (_a, mut rx) = subscriber(&registry, 16);

        let (handle, join) =
            Dispatcher::new(Arc::clone(&registry), OverflowPolicy::Disconnect).spawn(16);

        for n in 0..10 {
            handle.submit(Event::text(format!("E{n}"))).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(String::from_utf8(event.payload.to_vec()).unwrap());
        }
        let expected: Vec<_> = (0..10).map(|n| format!("E{n}")).collect();
        assert_eq!(seen, expected);

        // Dropping the last handle stops the task
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_errors() {
        let (tx, rx) = mpsc::channel(1);
        let handle = DispatcherHandle { tx };

        handle.submit(Event::text("E1")).unwrap();
        assert_eq!(handle.submit(Event::text("E2")), Err(SubmitError::QueueFull));

        drop(rx);
        assert_eq!(handle.submit(Event::text("E3")), Err(SubmitError::Stopped));
    }
}
