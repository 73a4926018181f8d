//! Core error types

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A tree node that is neither a tensor nor a traversable mapping
    #[error("Malformed parameter tree at '{path}': found {kind}, expected a tensor or a mapping")]
    Structure { path: String, kind: String },

    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),

    #[error("Invalid shape operation: {0}")]
    ShapeOp(String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDtype(String),

    #[error("Safetensors error: {0}")]
    Safetensors(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn structure(path: &[String], kind: impl Into<String>) -> Self {
        CoreError::Structure {
            path: path.join("/"),
            kind: kind.into(),
        }
    }
}
