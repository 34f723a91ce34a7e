//! HTTP Router
//!
//! Sets up the axum router: `/` serves ingress (`HEAD`, `POST`) and the
//! subscriber websocket (`GET` with upgrade).

use axum::{
    extract::{DefaultBodyLimit, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handler::handle_websocket;
use super::ingress::{ingest, liveness};
use super::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config().max_event_bytes;

    Router::new()
        // Subscribers upgrade on GET, the provider checks liveness with HEAD and delivers with POST
        .route("/", get(subscribe).head(liveness).post(ingest))
        .route("/ping", get(ping))
        // Health check for monitoring/load balancers
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

/// WebSocket upgrade handler; plain GETs get a greeting
async fn subscribe(ws: Option<WebSocketUpgrade>, State(state): State<AppState>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_websocket(socket, state)),
        None => Json(MessageResponse {
            message: "Hello from webhook-relay",
        })
        .into_response(),
    }
}

async fn ping() -> Json<MessageResponse> {
    Json(MessageResponse { message: "Pong" })
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    subscribers: usize,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        subscribers: state.subscriber_count(),
    })
}
