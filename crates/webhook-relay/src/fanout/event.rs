//! Relay Events
//!
//! An event is an opaque payload forwarded verbatim to subscribers.

use axum::extract::ws::Message;
use axum::http::{header, HeaderMap};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::ConnectionId;

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// How the payload is framed on the subscriber transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Binary,
}

/// Where an event came from
#[derive(Debug, Clone)]
pub enum EventSource {
    /// Pushed by the external provider over HTTP
    Webhook {
        /// Request headers as received
        headers: HeaderMap,
    },

    /// Sent by a connected subscriber
    Subscriber(ConnectionId),
}

/// A single unit of fan-out
#[derive(Debug, Clone)]
pub struct Event {
    /// Correlation id for logs and acknowledgements
    pub id: Uuid,

    /// Payload bytes, never inspected or rewritten
    pub payload: Bytes,

    /// Text or binary framing
    pub kind: PayloadKind,

    /// Arrival time at the relay
    pub received_at: DateTime<Utc>,

    /// Source metadata
    pub source: EventSource,
}

impl Event {
    /// Create an event from a webhook delivery
    ///
    /// Payloads that are valid UTF-8 are framed as text, anything else as binary.
    pub fn from_webhook(payload: Bytes, headers: HeaderMap) -> Self {
        let kind = if std::str::from_utf8(&payload).is_ok() {
            PayloadKind::Text
        } else {
            PayloadKind::Binary
        };

        Self {
            id: Uuid::new_v4(),
            payload,
            kind,
            received_at: Utc::now(),
            source: EventSource::Webhook { headers },
        }
    }

    /// Create an event from a message a subscriber sent
    pub fn from_subscriber(connection: ConnectionId, payload: Bytes, kind: PayloadKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            kind,
            received_at: Utc::now(),
            source: EventSource::Subscriber(connection),
        }
    }

    /// Shorthand for a text event, mostly useful in tests
    pub fn text(body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::from_webhook(Bytes::from(body), HeaderMap::new())
    }

    /// The subscriber that sent this event, if any
    pub fn sender(&self) -> Option<ConnectionId> {
        match self.source {
            EventSource::Subscriber(id) => Some(id),
            EventSource::Webhook { .. } => None,
        }
    }

    /// The `Content-Type` the provider declared
    pub fn content_type(&self) -> Option<&str> {
        match &self.source {
            EventSource::Webhook { headers } => headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            EventSource::Subscriber(_) => None,
        }
    }

    /// Check whether the payload parses as JSON
    pub fn is_json(&self) -> bool {
        serde_json::from_slice::<serde::de::IgnoredAny>(&self.payload).is_ok()
    }

    /// Build the websocket frame for this event
    pub fn to_message(&self) -> Message {
        match self.kind {
            PayloadKind::Text => Message::Text(String::from_utf8_lossy(&self.payload).into_owned()),
            PayloadKind::Binary => Message::Binary(self.payload.to_vec()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_framing() {
        let text = Event::from_webhook(Bytes::from_static(b"{\"type\":\"drip\"}"), HeaderMap::new());
        assert_eq!(text.kind, PayloadKind::Text);
        assert!(matches!(text.to_message(), Message::Text(t) if t == "{\"type\":\"drip\"}"));

        let binary = Event::from_webhook(Bytes::from_static(&[0xff, 0xfe, 0x00]), HeaderMap::new());
        assert_eq!(binary.kind, PayloadKind::Binary);
        assert!(matches!(binary.to_message(), Message::Binary(b) if b == vec![0xffu8, 0xfe, 0x00]));
    }

    #[test]
    fn test_content_type_and_json() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let event = Event::from_webhook(Bytes::from_static(b"{\"id\":\"abc\"}"), headers);

        assert_eq!(event.content_type(), Some("application/json"));
        assert!(event.is_json());
        assert!(event.sender().is_none());

        assert!(!Event::text("not json {").is_json());
    }

    #[test]
    fn test_subscriber_source() {
        let id = ConnectionId::new(7);
        let event = Event::from_subscriber(id, Bytes::from_static(b"ping"), PayloadKind::Text);

        assert_eq!(event.sender(), Some(id));
        assert_eq!(event.content_type(), None);
    }
}
