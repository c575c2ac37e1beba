//! API module for the Relay server
//!
//! Routes for firing triggers and resuming instances.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub mod health;
pub mod processes;

use crate::server::RelayServer;

/// Build the router for API endpoints
pub fn build_router(server: Arc<RelayServer>) -> Router {
    Router::new()
        // Triggers
        .route("/v1/processes/trigger", post(processes::trigger_handler))
        // Instances
        .route("/v1/instances/:id", get(processes::get_instance_handler))
        .route("/v1/instances/:id/run", post(processes::run_handler))
        .route(
            "/v1/instances/:id/tasks/:task_id/inputs",
            post(processes::enter_inputs_handler),
        )
        // Health check
        .route("/health", get(health::health_check))
        .with_state(server)
}

pub use health::*;
pub use processes::*;
