//! Server Application State
//!
//! Shared state accessible by the ingress handlers and every subscriber session.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::fanout::{CloseReason, Dispatcher, DispatcherHandle, Registry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Effective configuration
    config: RelayConfig,

    /// Connected subscribers
    registry: Arc<Registry>,

    /// Submission side of the dispatch task
    dispatcher: DispatcherHandle,
}

impl AppState {
    /// Create application state and spawn the dispatch task
    ///
    /// The returned task finishes once every clone of the state is dropped.
    pub fn new(config: RelayConfig) -> (Self, JoinHandle<()>) {
        let registry = Registry::new_shared();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.overflow_policy);
        let (dispatcher, dispatch_task) = dispatcher.spawn(config.dispatch_capacity);

        let state = Self {
            inner: Arc::new(AppStateInner {
                config,
                registry,
                dispatcher,
            }),
        };

        (state, dispatch_task)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Get the connection registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Get the dispatcher handle
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.inner.dispatcher
    }

    /// Get the number of connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Close every subscriber session
    pub fn close_all_sessions(&self) -> usize {
        self.inner.registry.close_all(CloseReason::Shutdown)
    }
}
