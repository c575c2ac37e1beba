use thiserror::Error;

/// Core error type for the Relay process engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Instance not found
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Process definition not found
    #[error("Process definition not found: {0}")]
    DefinitionNotFound(String),

    /// Task not found in the element graph
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A task references an object, field, lane, task or secret that cannot be resolved
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A uniqueness constraint rejected the write
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Connection-level failure that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// A dispatched service replied with an error
    #[error("Remote service error: {0}")]
    RemoteServiceError(String),

    /// A QL operator received data of the wrong cardinality
    #[error("Data shape error: {0}")]
    DataShapeError(String),

    /// Formula parse or evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Template rendering error
    #[error("Template error: {0}")]
    TemplateError(String),

    /// Element graph failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The operation does not fit the task's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A save lost the race against a newer write of the same instance
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// Persistence layer error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether a caller-driven retry may recover from this error
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    /// Whether the error reports a duplicate / already-applied outcome
    #[inline]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, CoreError::AlreadyExists(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
