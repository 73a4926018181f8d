//! Mapping error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MappingError>;

#[derive(Debug, Error)]
pub enum MappingError {
    /// No complete (param, shape, hook) triple registered under this key
    #[error("Mappings not found for model '{key}' (missing: {missing:?}). Available: {available:?}")]
    UnknownArchitecture {
        key: String,
        missing: Vec<&'static str>,
        available: Vec<String>,
    },

    #[error("Invalid name pattern: {0}")]
    InvalidPattern(String),

    #[error("Model config error: {0}")]
    Config(String),

    #[error("Hook error: {0}")]
    Hook(#[from] shardconv_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
