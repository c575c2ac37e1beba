//! Trigger and resume handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use relay_core::{InstanceId, InstanceKey, TaskId, TriggerOutcome};

use crate::error::{ServerError, ServerResult};
use crate::server::RelayServer;

/// Body of `POST /v1/processes/trigger`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    /// Diagram document, either as source text or as a JSON object
    pub definition: Value,

    /// Trigger payload, stored as the trigger task's output
    #[serde(default)]
    pub payload: Value,

    /// Deduplication key
    pub instance_key: String,
}

impl TriggerRequest {
    fn source(&self) -> ServerResult<String> {
        match &self.definition {
            Value::String(text) => Ok(text.clone()),
            Value::Object(_) => Ok(serde_json::to_string(&self.definition)
                .map_err(|e| ServerError::BadRequest(e.to_string()))?),
            _ => Err(ServerError::BadRequest(
                "definition must be a document string or object".to_string(),
            )),
        }
    }
}

/// Fire a trigger, creating and running an instance unless the key was seen before
pub async fn trigger_handler(
    State(server): State<Arc<RelayServer>>,
    Json(request): Json<TriggerRequest>,
) -> ServerResult<impl IntoResponse> {
    if request.instance_key.trim().is_empty() {
        return Err(ServerError::BadRequest("instanceKey is required".to_string()));
    }
    let source = request.source()?;

    let outcome = server
        .manager()
        .trigger(&source, request.payload, InstanceKey(request.instance_key))
        .await?;

    let response = match outcome {
        TriggerOutcome::Created { instance, report } => {
            info!(instance_id = %instance.id, status = ?instance.status, "Trigger created instance");
            (
                StatusCode::CREATED,
                Json(json!({
                    "status": "created",
                    "instance": instance,
                    "report": report,
                })),
            )
        }
        TriggerOutcome::AlreadyTriggered { instance_key } => (
            StatusCode::OK,
            Json(json!({
                "status": "alreadyTriggered",
                "instanceKey": instance_key.0,
            })),
        ),
    };
    Ok(response)
}

/// Resume an instance
pub async fn run_handler(
    State(server): State<Arc<RelayServer>>,
    Path(id): Path<String>,
) -> ServerResult<impl IntoResponse> {
    let (instance, report) = server.manager().run(&InstanceId(id)).await?;
    Ok(Json(json!({ "instance": instance, "report": report })))
}

/// Submit form values to a waiting task and resume the instance
pub async fn enter_inputs_handler(
    State(server): State<Arc<RelayServer>>,
    Path((id, task_id)): Path<(String, String)>,
    Json(values): Json<Map<String, Value>>,
) -> ServerResult<impl IntoResponse> {
    let (instance, report) = server
        .manager()
        .enter_inputs(&InstanceId(id), &TaskId::new(task_id), values)
        .await?;
    Ok(Json(json!({ "instance": instance, "report": report })))
}

/// Fetch an instance
pub async fn get_instance_handler(
    State(server): State<Arc<RelayServer>>,
    Path(id): Path<String>,
) -> ServerResult<impl IntoResponse> {
    let instance = server
        .manager()
        .find_instance(&InstanceId(id.clone()))
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Instance {}", id)))?;
    Ok(Json(instance))
}
