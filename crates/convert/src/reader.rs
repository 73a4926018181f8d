//! Hub bundle reader
//!
//! Reads both the single-file and the indexed multi-file layouts through
//! memory-mapped safetensors.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use shardconv_core::io::read_safetensors;
use shardconv_core::Tensor;
use shardconv_mapping::ModelDims;
use tracing::debug;

use crate::error::{ConvertError, Result};
use crate::writer::{WeightIndex, CONFIG_FILE, SINGLE_WEIGHTS_FILE, WEIGHTS_INDEX_FILE};

pub struct BundleReader {
    dir: PathBuf,
    config: ModelDims,
    weight_files: Vec<PathBuf>,
}

impl BundleReader {
    /// Open a bundle directory holding `config.json` and weight files
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(ConvertError::InvalidBundle(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let config = ModelDims::from_json_file(dir.join(CONFIG_FILE))?;

        let index_path = dir.join(WEIGHTS_INDEX_FILE);
        let weight_files = if index_path.is_file() {
            let index: WeightIndex = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
            let files: BTreeSet<&String> = index.weight_map.values().collect();
            files.into_iter().map(|f| dir.join(f)).collect()
        } else if dir.join(SINGLE_WEIGHTS_FILE).is_file() {
            vec![dir.join(SINGLE_WEIGHTS_FILE)]
        } else {
            return Err(ConvertError::InvalidBundle(format!(
                "{} has neither {} nor {}",
                dir.display(),
                SINGLE_WEIGHTS_FILE,
                WEIGHTS_INDEX_FILE
            )));
        };

        Ok(Self {
            dir,
            config,
            weight_files,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &ModelDims {
        &self.config
    }

    pub fn weight_files(&self) -> &[PathBuf] {
        &self.weight_files
    }

    /// Decode every tensor of the bundle, keyed by name
    pub fn tensors(&self) -> Result<BTreeMap<String, Tensor>> {
        let mut out = BTreeMap::new();
        for path in &self.weight_files {
            let file = std::fs::File::open(path)?;
            // The file is read-only for the lifetime of the map
            let mmap = unsafe { Mmap::map(&file)? };
            let tensors = read_safetensors(&mmap)?;
            debug!(file = %path.display(), tensors = tensors.len(), "Read weight file");
            for (name, tensor) in tensors {
                if out.insert(name.clone(), tensor).is_some() {
                    return Err(ConvertError::DuplicateTarget(name));
                }
            }
        }
        Ok(out)
    }
}
