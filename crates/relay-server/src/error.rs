//! Error types for the Relay server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use relay_core::CoreError;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Error raised by the process engine
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        ServerError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::InternalError(format!("IO error: {}", err))
    }
}

impl ServerError {
    /// HTTP status and stable error code for this error
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND"),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "ERR_BAD_REQUEST"),
            ServerError::ConfigError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ERR_SERVER_CONFIGURATION")
            }
            ServerError::InternalError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR")
            }
            ServerError::Core(core) => match core {
                CoreError::InstanceNotFound(_)
                | CoreError::DefinitionNotFound(_)
                | CoreError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND"),
                CoreError::ValidationError(_) | CoreError::SerializationError(_) => {
                    (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR")
                }
                CoreError::ConfigurationError(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "ERR_TASK_CONFIGURATION")
                }
                CoreError::DataShapeError(_)
                | CoreError::ExpressionError(_)
                | CoreError::TemplateError(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "ERR_TASK_EXECUTION")
                }
                CoreError::AlreadyExists(_) => (StatusCode::CONFLICT, "ERR_ALREADY_EXISTS"),
                CoreError::InvalidState(_) => (StatusCode::CONFLICT, "ERR_INVALID_STATE"),
                CoreError::VersionConflict(_) => (StatusCode::CONFLICT, "ERR_VERSION_CONFLICT"),
                CoreError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "ERR_TRANSIENT"),
                CoreError::RemoteServiceError(_) => (StatusCode::BAD_GATEWAY, "ERR_REMOTE_SERVICE"),
                CoreError::StateStoreError(_) | CoreError::Other(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR")
                }
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.to_string();
        if status.is_server_error() {
            error!(code, error = %message, "Request failed");
        } else {
            warn!(code, error = %message, "Request rejected");
        }

        let body = Json(json!({
            "error": message,
            "errorDetails": {
                "errorCode": code,
                "errorMessage": message,
            }
        }));
        (status, body).into_response()
    }
}
