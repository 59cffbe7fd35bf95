use thiserror::Error;

/// Convenience type alias for Results with MeshError
pub type Result<T> = std::result::Result<T, MeshError>;

/// Main error type for the coordination core
///
/// Operations that can fail for expected reasons (unknown task, illegal
/// transition, quota exhausted) return `bool` or `Option` instead of an
/// error; this enum covers validation failures, configuration problems,
/// and genuine invariant violations.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Routing error: {message}")]
    Routing { message: String },

    #[error("Task error: {task_id} - {message}")]
    Task { task_id: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
