//! ShardConv Mapping Registry
//!
//! Per-architecture name, shape and hook tables that drive conversion
//! between the internal parameter tree and hub checkpoint bundles.

pub mod architecture;
pub mod config;
mod error;
pub mod hook;
pub mod pattern;
pub mod registry;
pub mod spec;
pub mod tables;

pub use architecture::{Architecture, ModelFamily};
pub use config::{GenerationConfig, ModelDims, TokenIds};
pub use error::{MappingError, Result};
pub use hook::{Hook, HookOp};
pub use pattern::{NamePattern, LAYER_PLACEHOLDER};
pub use registry::{MappingRegistry, RegistryBuilder};
pub use spec::{Direction, EntryMatch, MappingSpec, ParamEntry, StackSlicer};
pub use tables::ArchitectureTables;
