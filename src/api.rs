//! HTTP introspection endpoints

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::{ChannelSummary, Relay};

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub channels: usize,
}

/// GET /health
pub async fn health(State(relay): State<Arc<Relay>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: relay.registry.len().await,
        channels: relay.directory.channel_count().await,
    })
}

/// GET /api/channels
///
/// Live frequencies with their member counts. Member identities are not exposed.
pub async fn list_channels(State(relay): State<Arc<Relay>>) -> Json<Vec<ChannelSummary>> {
    Json(relay.directory.channel_summaries().await)
}
