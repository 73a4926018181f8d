//! Versioned checkpoint storage

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shardconv_core::io::{read_safetensors, write_safetensors};
use shardconv_core::ParameterTree;
use tracing::debug;

use crate::error::{CheckpointError, Result};
use crate::state::{OptimizerState, TrainState};

pub const PARAMS_FILE: &str = "params.safetensors";
pub const METADATA_FILE: &str = "metadata.json";
pub const FORMAT_VERSION: u32 = 1;

/// A step-indexed store; every step is written at most once
pub trait CheckpointBackend: Send + Sync + 'static {
    /// Durably persist one step
    fn write(&self, state: &TrainState) -> Result<()>;

    /// Committed steps, ascending
    fn all_steps(&self) -> Result<Vec<u64>>;

    fn read(&self, step: u64) -> Result<TrainState>;

    fn delete(&self, step: u64) -> Result<()>;
}

/// `metadata.json` of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub format_version: u32,
    pub step: u64,
    pub opt_state: OptimizerState,
    pub num_tensors: usize,
    pub num_parameters: usize,
    /// Tensor count per dtype
    pub dtypes: BTreeMap<String, usize>,
}

/// One directory per step under a root
///
/// ```text
/// <root>/<step>/params.safetensors
/// <root>/<step>/metadata.json
/// ```
///
/// A step is written into `<root>/<step>.tmp` and renamed when complete, so
/// a numbered directory is always a committed step.
#[derive(Debug, Clone)]
pub struct LocalCheckpointBackend {
    root: PathBuf,
}

impl LocalCheckpointBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn step_dir(&self, step: u64) -> PathBuf {
        self.root.join(step.to_string())
    }

    pub fn read_metadata(&self, step: u64) -> Result<StepMetadata> {
        let path = self.step_dir(step).join(METADATA_FILE);
        if !path.is_file() {
            return Err(CheckpointError::StepNotFound(step));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

impl CheckpointBackend for LocalCheckpointBackend {
    fn write(&self, state: &TrainState) -> Result<()> {
        let final_dir = self.step_dir(state.step);
        if final_dir.exists() {
            return Err(CheckpointError::StepExists(state.step));
        }
        let tmp = self.root.join(format!("{}.tmp", state.step));
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;

        let flat = state.params.flatten()?;
        let mut dtypes = BTreeMap::new();
        for (_, tensor) in &flat {
            *dtypes.entry(tensor.dtype().to_string()).or_insert(0) += 1;
        }
        let metadata = StepMetadata {
            format_version: FORMAT_VERSION,
            step: state.step,
            opt_state: state.opt_state,
            num_tensors: flat.len(),
            num_parameters: flat.iter().map(|(_, t)| t.numel()).sum(),
            dtypes,
        };

        write_safetensors(
            flat.iter().map(|(name, tensor)| (name.as_str(), tensor)),
            None,
            &tmp.join(PARAMS_FILE),
        )?;
        std::fs::write(tmp.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;
        std::fs::rename(&tmp, &final_dir)?;

        debug!(step = state.step, tensors = metadata.num_tensors, "Committed checkpoint step");
        Ok(())
    }

    fn all_steps(&self) -> Result<Vec<u64>> {
        let mut steps = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(step) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    fn read(&self, step: u64) -> Result<TrainState> {
        let metadata = self.read_metadata(step)?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(CheckpointError::InvalidLayout(format!(
                "step {} has format version {}, expected {}",
                step, metadata.format_version, FORMAT_VERSION
            )));
        }
        let bytes = std::fs::read(self.step_dir(step).join(PARAMS_FILE))?;
        let params = ParameterTree::from_flat(read_safetensors(&bytes)?)?;
        Ok(TrainState {
            step: metadata.step,
            params,
            opt_state: metadata.opt_state,
        })
    }

    fn delete(&self, step: u64) -> Result<()> {
        let dir = self.step_dir(step);
        if !dir.is_dir() {
            return Err(CheckpointError::StepNotFound(step));
        }
        std::fs::remove_dir_all(dir)?;
        debug!(step, "Deleted checkpoint step");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use shardconv_core::{DType, Tensor};

    use super::*;

    fn params() -> ParameterTree {
        ParameterTree::from_flat(vec![
            ("decoder/decoder_norm/scale", Tensor::from_f32(vec![3], &[1.0, 2.0, 3.0]).unwrap()),
            ("token_embedder/embedding", Tensor::zeros(vec![4, 3], DType::BF16)),
            ("step_counter", Tensor::from_i32(vec![1], &[7]).unwrap()),
        ])
        .unwrap()
    }

    #[test]
    fn test_write_read_step() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalCheckpointBackend::new(root.path()).unwrap();
        backend.write(&TrainState::inference(0, params())).unwrap();

        assert_eq!(backend.all_steps().unwrap(), vec![0]);
        assert!(!root.path().join("0.tmp").exists());

        let restored = backend.read(0).unwrap();
        assert_eq!(restored.step, 0);
        assert_eq!(restored.opt_state, OptimizerState::Empty);
        assert_eq!(restored.params.flatten().unwrap(), params().flatten().unwrap());

        let metadata = backend.read_metadata(0).unwrap();
        assert_eq!(metadata.num_tensors, 3);
        assert_eq!(metadata.num_parameters, 3 + 12 + 1);
        assert_eq!(metadata.dtypes["bfloat16"], 1);
    }

    #[test]
    fn test_step_written_once() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalCheckpointBackend::new(root.path()).unwrap();
        backend.write(&TrainState::inference(5, params())).unwrap();
        assert!(matches!(
            backend.write(&TrainState::inference(5, params())),
            Err(CheckpointError::StepExists(5))
        ));
    }

    #[test]
    fn test_steps_ignore_staging_and_files() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalCheckpointBackend::new(root.path()).unwrap();
        backend.write(&TrainState::inference(10, params())).unwrap();
        backend.write(&TrainState::inference(2, params())).unwrap();
        std::fs::create_dir(root.path().join("3.tmp")).unwrap();
        std::fs::write(root.path().join("4"), b"").unwrap();

        assert_eq!(backend.all_steps().unwrap(), vec![2, 10]);
        backend.delete(2).unwrap();
        assert_eq!(backend.all_steps().unwrap(), vec![10]);
        assert!(matches!(backend.delete(2), Err(CheckpointError::StepNotFound(2))));
        assert!(matches!(backend.read(99), Err(CheckpointError::StepNotFound(99))));
    }
}
