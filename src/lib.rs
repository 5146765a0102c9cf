// Public API for integration tests and embedding

pub mod abuse;
pub mod api;
pub mod config;
pub mod error;
pub mod protocol;
pub mod state;
pub mod types;
pub mod ws;

use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use state::Relay;

/// Build the HTTP router: WebSocket gateway plus introspection endpoints
pub fn app(relay: Arc<Relay>) -> Router {
    let ws_routes = Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            relay.clone(),
            abuse::connection_limit_middleware,
        ));

    Router::new()
        .merge(ws_routes)
        .route("/health", get(api::health))
        .route("/api/channels", get(api::list_channels))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}
