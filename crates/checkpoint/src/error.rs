//! Checkpoint error types

use shardconv_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Checkpoint for step {0} already exists")]
    StepExists(u64),

    #[error("No checkpoint for step {0}")]
    StepNotFound(u64),

    /// An asynchronous write failed; surfaced by the next wait
    #[error("Checkpoint write for step {step} failed: {reason}")]
    WriteFailed { step: u64, reason: String },

    #[error("Checkpoint task failed: {0}")]
    TaskJoin(String),

    #[error("Invalid checkpoint layout: {0}")]
    InvalidLayout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
