//! Health check endpoint for the Relay server

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::server::RelayServer;

/// Health check handler
pub async fn health_check(State(server): State<Arc<RelayServer>>) -> impl IntoResponse {
    debug!("Health check requested");

    Json(json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
        "store": server.store().as_str(),
        "gateway": server.config().service_url.is_some(),
    }))
}
