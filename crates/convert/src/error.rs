//! Conversion error types

use shardconv_core::CoreError;
use shardconv_mapping::{Direction, MappingError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvertError>;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// A concrete name matched no mapping entry; never skipped
    #[error("No mapping entry matches '{0}'")]
    Unmapped(String),

    #[error("'{name}' matches {count} mapping entries")]
    AmbiguousPath { name: String, count: usize },

    #[error("Weight shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("No expected shape registered for '{0}'")]
    MissingShape(String),

    #[error("Stacked leaf '{path}' has leading dimension {got}, expected {expected} layers")]
    LayerCountMismatch {
        path: String,
        expected: usize,
        got: usize,
    },

    #[error("Target '{0}' produced more than once")]
    DuplicateTarget(String),

    #[error("Stacked parameter '{path}' is missing layers {missing:?}")]
    IncompleteStack { path: String, missing: Vec<usize> },

    #[error("Context is configured for {got}, operation requires {expected}")]
    WrongDirection { expected: Direction, got: Direction },

    #[error("No tensors were converted; check the architecture mapping and the input tree")]
    EmptyBundle,

    #[error("Output directory already exists: {0} (pass overwrite to replace it)")]
    OutputExists(String),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Hub error: {0}")]
    Hub(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
