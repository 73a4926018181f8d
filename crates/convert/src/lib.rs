//! ShardConv Conversion
//!
//! Leaf processing, import, and hub bundle I/O:
//! - Internal parameter tree → named hub tensors ([`process`], [`build_bundle`])
//! - Hub tensors → internal parameter tree ([`import_tensors`])
//! - Staged bundle writing and memory-mapped reading

mod bundle;
mod context;
mod error;
mod importer;
mod pipeline;
mod processor;
mod reader;
mod tokenizer;
mod writer;

pub use bundle::OutputBundle;
pub use context::ConversionContext;
pub use error::{ConvertError, Result};
pub use importer::{import_tensors, StackAssembler};
pub use pipeline::{build_bundle, export_tree, import_bundle};
pub use processor::process;
pub use reader::BundleReader;
pub use tokenizer::{TokenizerArtifacts, TokenizerSource, OPTIONAL_TOKENIZER_FILES, TOKENIZER_FILE};
pub use writer::{
    BundleWriter, IndexMetadata, WeightIndex, WriteSummary, CONFIG_FILE, DEFAULT_MAX_SHARD_BYTES,
    GENERATION_CONFIG_FILE, SINGLE_WEIGHTS_FILE, WEIGHTS_INDEX_FILE,
};
