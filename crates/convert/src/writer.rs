//! Hub bundle writer
//!
//! A bundle is staged next to its destination and moved into place with a
//! single rename, so a directory at `output_dir` is always a finished bundle.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shardconv_core::io::write_safetensors;
use shardconv_core::Tensor;
use tracing::{debug, info, warn};

use crate::bundle::OutputBundle;
use crate::error::{ConvertError, Result};

pub const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
pub const CONFIG_FILE: &str = "config.json";
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// Default weight file size limit (5 GiB)
pub const DEFAULT_MAX_SHARD_BYTES: usize = 5 * 1024 * 1024 * 1024;

/// `model.safetensors.index.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightIndex {
    pub metadata: IndexMetadata,
    pub weight_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub total_size: usize,
}

/// What a successful write produced
#[derive(Debug, Clone)]
pub struct WriteSummary {
    pub output_dir: PathBuf,
    pub weight_files: Vec<String>,
    pub num_tensors: usize,
    pub total_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct BundleWriter {
    max_shard_bytes: usize,
    overwrite: bool,
}

impl Default for BundleWriter {
    fn default() -> Self {
        Self {
            max_shard_bytes: DEFAULT_MAX_SHARD_BYTES,
            overwrite: false,
        }
    }
}

impl BundleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_shard_bytes(mut self, bytes: usize) -> Self {
        self.max_shard_bytes = bytes.max(1);
        self
    }

    /// Allow replacing a bundle already present at the destination
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn write(&self, bundle: &OutputBundle, output_dir: impl AsRef<Path>) -> Result<WriteSummary> {
        let output_dir = output_dir.as_ref();
        if bundle.is_empty() {
            return Err(ConvertError::EmptyBundle);
        }
        if output_dir.exists() && !self.overwrite {
            return Err(ConvertError::OutputExists(output_dir.display().to_string()));
        }

        let staging = sibling(output_dir, "staging")?;
        if staging.exists() {
            warn!(path = %staging.display(), "Removing stale staging directory");
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        let weight_files = match self.stage(bundle, &staging) {
            Ok(files) => files,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(e);
            }
        };

        commit(&staging, output_dir)?;

        let summary = WriteSummary {
            output_dir: output_dir.to_path_buf(),
            weight_files,
            num_tensors: bundle.len(),
            total_bytes: bundle.total_bytes(),
        };
        info!(
            path = %output_dir.display(),
            tensors = summary.num_tensors,
            files = summary.weight_files.len(),
            "Bundle written"
        );
        Ok(summary)
    }

    fn stage(&self, bundle: &OutputBundle, dir: &Path) -> Result<Vec<String>> {
        let shards = plan_shards(bundle.tensors(), self.max_shard_bytes);
        let weight_files = if shards.len() == 1 {
            vec![SINGLE_WEIGHTS_FILE.to_string()]
        } else {
            (1..=shards.len())
                .map(|k| format!("model-{:05}-of-{:05}.safetensors", k, shards.len()))
                .collect()
        };

        let metadata: HashMap<String, String> = [("format".to_string(), "pt".to_string())].into();
        let mut weight_map = BTreeMap::new();
        for (file, names) in weight_files.iter().zip(&shards) {
            let tensors = names.iter().filter_map(|name| {
                bundle
                    .tensors()
                    .get_key_value(*name)
                    .map(|(k, t)| (k.as_str(), t))
            });
            write_safetensors(tensors, Some(metadata.clone()), &dir.join(file))?;
            for name in names {
                weight_map.insert(name.to_string(), file.clone());
            }
            debug!(file = %file, tensors = names.len(), "Wrote weight file");
        }

        if weight_files.len() > 1 {
            let index = WeightIndex {
                metadata: IndexMetadata {
                    total_size: bundle.total_bytes(),
                },
                weight_map,
            };
            std::fs::write(dir.join(WEIGHTS_INDEX_FILE), serde_json::to_string_pretty(&index)?)?;
        }

        let config = bundle.config_document().to_json_pretty()?;
        std::fs::write(dir.join(CONFIG_FILE), config)?;
        std::fs::write(
            dir.join(GENERATION_CONFIG_FILE),
            serde_json::to_string_pretty(bundle.generation_config())?,
        )?;

        match bundle.tokenizer() {
            Some(tokenizer) => tokenizer.write_to(dir)?,
            None => warn!("Bundle has no tokenizer artifacts"),
        }

        Ok(weight_files)
    }
}

/// Partition names (in name order) into files of at most `max_bytes`
///
/// A tensor larger than the limit gets a file of its own.
fn plan_shards(tensors: &BTreeMap<String, Tensor>, max_bytes: usize) -> Vec<Vec<&str>> {
    let mut shards: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_bytes = 0;
    for (name, tensor) in tensors {
        let size = tensor.size_bytes();
        if !current.is_empty() && current_bytes + size > max_bytes {
            shards.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(name.as_str());
        current_bytes += size;
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

/// `<dir>.<suffix>` next to `dir`
fn sibling(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| ConvertError::InvalidBundle(format!("{} has no directory name", dir.display())))?;
    let mut sibling = name.to_os_string();
    sibling.push(".");
    sibling.push(suffix);
    Ok(dir.with_file_name(sibling))
}

/// Move the staged bundle into place
///
/// A previous bundle is moved aside first and removed only once the new one
/// is at `output_dir`.
fn commit(staging: &Path, output_dir: &Path) -> Result<()> {
    if let Some(parent) = output_dir.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if !output_dir.exists() {
        std::fs::rename(staging, output_dir)?;
        return Ok(());
    }

    let previous = sibling(output_dir, "previous")?;
    if previous.exists() {
        std::fs::remove_dir_all(&previous)?;
    }
    std::fs::rename(output_dir, &previous)?;
    if let Err(e) = std::fs::rename(staging, output_dir) {
        let _ = std::fs::rename(&previous, output_dir);
        return Err(e.into());
    }
    std::fs::remove_dir_all(&previous)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use shardconv_core::DType;
    use shardconv_mapping::Architecture;

    use super::*;
    use crate::tokenizer::tests::TINY_TOKENIZER;
    use crate::tokenizer::TokenizerArtifacts;

    fn bundle(n: usize) -> OutputBundle {
        let mut bundle = OutputBundle::new(Architecture::Qwen3_0_6B.hub_config());
        for i in 0..n {
            let values: Vec<f32> = (0..16).map(|v| (v + i) as f32).collect();
            bundle
                .insert(format!("t{}", i), Tensor::from_f32(vec![4, 4], &values).unwrap())
                .unwrap();
        }
        bundle
    }

    #[test]
    fn test_empty_bundle_writes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("bundle");
        let err = BundleWriter::new().write(&bundle(0), &out).unwrap_err();
        assert!(matches!(err, ConvertError::EmptyBundle));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_single_file_layout() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("bundle");
        let summary = BundleWriter::new().write(&bundle(3), &out).unwrap();

        assert_eq!(summary.weight_files, vec![SINGLE_WEIGHTS_FILE]);
        assert!(out.join(SINGLE_WEIGHTS_FILE).is_file());
        assert!(out.join(CONFIG_FILE).is_file());
        assert!(out.join(GENERATION_CONFIG_FILE).is_file());
        assert!(!out.join(WEIGHTS_INDEX_FILE).exists());
        assert!(!root.path().join("bundle.staging").exists());

        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join(CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(config["torch_dtype"], "float32");
    }

    #[test]
    fn test_sharded_layout_with_index() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("bundle");
        // Each tensor is 64 bytes, two fit per file
        let summary = BundleWriter::new()
            .with_max_shard_bytes(128)
            .write(&bundle(5), &out)
            .unwrap();

        assert_eq!(
            summary.weight_files,
            vec![
                "model-00001-of-00003.safetensors",
                "model-00002-of-00003.safetensors",
                "model-00003-of-00003.safetensors",
            ]
        );
        let index: WeightIndex =
            serde_json::from_str(&std::fs::read_to_string(out.join(WEIGHTS_INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(index.metadata.total_size, 5 * 64);
        assert_eq!(index.weight_map.len(), 5);
        assert_eq!(index.weight_map["t4"], "model-00003-of-00003.safetensors");
    }

    #[test]
    fn test_refuses_existing_output_without_overwrite() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("bundle");
        BundleWriter::new().write(&bundle(1), &out).unwrap();

        let err = BundleWriter::new().write(&bundle(2), &out).unwrap_err();
        assert!(matches!(err, ConvertError::OutputExists(_)));

        BundleWriter::new()
            .with_overwrite(true)
            .write(&bundle(2), &out)
            .unwrap();
        assert!(!root.path().join("bundle.previous").exists());
        assert!(out.join(SINGLE_WEIGHTS_FILE).is_file());
    }

    #[test]
    fn test_tokenizer_artifacts_are_copied() {
        let root = tempfile::tempdir().unwrap();
        let tok_dir = root.path().join("tok");
        std::fs::create_dir(&tok_dir).unwrap();
        std::fs::write(tok_dir.join("tokenizer.json"), TINY_TOKENIZER).unwrap();
        std::fs::write(tok_dir.join("special_tokens_map.json"), "{}").unwrap();

        let tokenizer = TokenizerArtifacts::from_dir(&tok_dir).unwrap();
        let out = root.path().join("bundle");
        BundleWriter::new()
            .write(&bundle(1).with_tokenizer(tokenizer), &out)
            .unwrap();
        assert!(out.join("tokenizer.json").is_file());
        assert!(out.join("special_tokens_map.json").is_file());
    }

    #[test]
    fn test_plan_keeps_oversized_tensor_alone() {
        let mut tensors = BTreeMap::new();
        tensors.insert("a".to_string(), Tensor::zeros(vec![2], DType::F32));
        tensors.insert("b".to_string(), Tensor::zeros(vec![100], DType::F32));
        tensors.insert("c".to_string(), Tensor::zeros(vec![2], DType::F32));
        let shards = plan_shards(&tensors, 16);
        assert_eq!(shards, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }
}
