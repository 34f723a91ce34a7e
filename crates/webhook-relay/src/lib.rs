//! Webhook Relay
//!
//! Accepts event notifications pushed over HTTP by an external provider and
//! rebroadcasts them in real time to every connected websocket subscriber:
//! - Connection registry and broadcast dispatcher (`fanout`)
//! - HTTP ingress and subscriber sessions (`server`)
//! - Layered configuration (`config`)

// Relay core
pub mod fanout;

// HTTP / WebSocket surface
pub mod server;

// Configuration
pub mod config;
