//! Inbound Event Ingress
//!
//! HTTP handlers the external provider calls. They never wait on subscriber
//! delivery: the body is queued for the dispatcher and the response goes out
//! immediately.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use super::state::AppState;
use crate::config::IngressResponse;
use crate::fanout::Event;

/// Fixed acknowledgement body
#[derive(Debug, Serialize)]
struct Accepted {
    status: &'static str,
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct Rejected {
    error: &'static str,
}

/// Liveness check: `HEAD /`
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Event delivery: `POST /`
pub async fn ingest(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    // Empty-body preflight
    if body.is_empty() {
        return StatusCode::OK.into_response();
    }

    let content_type = headers.get(header::CONTENT_TYPE).cloned();
    let event = Event::from_webhook(body.clone(), headers);

    if state.config().require_json && !event.is_json() {
        tracing::warn!(event_id = %event.id, "Rejected event with non-JSON body");
        return (
            StatusCode::BAD_REQUEST,
            Json(Rejected {
                error: "event body must be valid JSON",
            }),
        )
            .into_response();
    }

    let event_id = event.id;
    match state.dispatcher().submit(event) {
        Ok(_) => {
            tracing::debug!(event_id = %event_id, bytes = body.len(), "Event accepted");
        }
        Err(e) => {
            tracing::warn!(event_id = %event_id, error = %e, "Event dropped before dispatch");
        }
    }

    match state.config().ingress_response {
        IngressResponse::Echo => match content_type {
            Some(ct) => (StatusCode::OK, [(header::CONTENT_TYPE, ct)], body).into_response(),
            None => (StatusCode::OK, body).into_response(),
        },
        IngressResponse::Ack => (
            StatusCode::OK,
            Json(Accepted {
                status: "accepted",
                id: event_id,
            }),
        )
            .into_response(),
    }
}
