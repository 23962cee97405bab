//! Engine error types.

use thiserror::Error;

/// Errors that can occur while operating the task execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The task identifier does not exist in the Durable Store.
    #[error("task not found: {0}")]
    NotFound(String),

    /// `start` was attempted while a worker for this task already exists.
    #[error("task already running: {0}")]
    AlreadyRunning(String),

    /// A stage coroutine raised an error.
    #[error("stage {stage} failed: {message}")]
    StageError { stage: String, message: String },

    /// The Worker's hard deadline elapsed before the pipeline finished.
    #[error("task exceeded maximum duration")]
    DeadlineExceeded,

    /// The task was cancelled via `Registry::stop`.
    #[error("cancelled")]
    Cancelled,

    /// A Durable Store write failed. Never aborts the task that produced it.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// The push-stream transport failed to send or receive a frame.
    #[error("transport error: {0}")]
    TransportError(String),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying SQL error from the Durable Store reference implementation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Engine result type alias.
pub type EngineResult<T> = Result<T, EngineError>;
