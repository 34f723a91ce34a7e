//! HTTP and WebSocket Server
//!
//! Exposes the webhook ingress and the subscriber websocket on the same path.

mod handler;
mod ingress;
mod router;
mod state;

pub use handler::*;
pub use ingress::*;
pub use router::*;
pub use state::*;
