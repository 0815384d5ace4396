//! Error types for crmqa

use thiserror::Error;

/// Result type alias using crmqa Error
pub type Result<T> = std::result::Result<T, Error>;

/// crmqa error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown task state: {0}")]
    UnknownState(String),

    #[error("Task queue is full ({capacity} tasks admitted)")]
    QueueFull { capacity: usize },

    #[error("Executor is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn task_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "task".to_string(),
            id: id.into(),
        }
    }
}
