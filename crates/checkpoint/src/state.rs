//! Persisted training state

use serde::{Deserialize, Serialize};
use shardconv_core::ParameterTree;

/// Optimizer state carried by a checkpoint
///
/// Inference checkpoints carry none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerState {
    #[default]
    Empty,
}

/// Everything one checkpoint step persists
#[derive(Debug, Clone)]
pub struct TrainState {
    pub step: u64,
    pub params: ParameterTree,
    pub opt_state: OptimizerState,
}

impl TrainState {
    /// Parameters only, no optimizer state
    pub fn inference(step: u64, params: ParameterTree) -> Self {
        Self {
            step,
            params,
            opt_state: OptimizerState::Empty,
        }
    }
}
