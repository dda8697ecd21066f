use crate::job::JobClass;
use thiserror::Error;

/// Errors surfaced by the job queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Handler for {class} timed out after {elapsed_ms}ms")]
    Timeout { class: JobClass, elapsed_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl QueueError {
    /// Wrap an arbitrary handler failure.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        QueueError::Handler(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
