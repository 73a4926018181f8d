//! ShardConv Checkpoint Store
//!
//! Step-indexed checkpoint persistence with asynchronous writes, preemption
//! detection and drain-before-exit.

mod backend;
mod error;
mod manager;
mod preemption;
mod state;

pub use backend::{CheckpointBackend, LocalCheckpointBackend, StepMetadata, FORMAT_VERSION, METADATA_FILE, PARAMS_FILE};
pub use error::{CheckpointError, Result};
pub use manager::{CheckpointManager, CheckpointOptions, CheckpointPhase};
pub use preemption::PreemptionSignal;
pub use state::{OptimizerState, TrainState};
