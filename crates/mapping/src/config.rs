//! Hub model configuration (`config.json`)
//!
//! The same document drives the shape tables (model dimensions) and is
//! written verbatim next to the exported weights.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MappingError, Result};

/// Model configuration in the hub `config.json` schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDims {
    /// Model class names, e.g. `LlamaForCausalLM`
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Hub model type, e.g. `llama`, `qwen3`
    #[serde(default = "default_model_type")]
    pub model_type: String,

    /// Hidden size (embedding dimension)
    pub hidden_size: usize,

    /// Intermediate size (FFN hidden dimension)
    pub intermediate_size: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA)
    pub num_key_value_heads: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Vocabulary size
    pub vocab_size: usize,

    /// Per-head dimension; defaults to hidden_size / num_attention_heads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_dim: Option<usize>,

    /// Maximum sequence length
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// RoPE theta
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// RoPE scaling block, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_scaling: Option<serde_json::Value>,

    /// Whether to tie input/output embeddings
    #[serde(default)]
    pub tie_word_embeddings: bool,

    /// Whether attention projections have bias
    #[serde(default)]
    pub attention_bias: bool,

    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token_id: Option<TokenIds>,

    /// Instruct checkpoints often list several stop tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token_id: Option<TokenIds>,

    /// Weight dtype recorded in the document (`bfloat16`, `float32`, ...)
    #[serde(default = "default_torch_dtype")]
    pub torch_dtype: String,
}

/// A special token id, written either as one id or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

fn default_model_type() -> String { "llama".to_string() }
fn default_max_position_embeddings() -> usize { 2048 }
fn default_rms_norm_eps() -> f64 { 1e-5 }
fn default_rope_theta() -> f64 { 10000.0 }
fn default_hidden_act() -> String { "silu".to_string() }
fn default_torch_dtype() -> String { "float32".to_string() }

impl ModelDims {
    /// Load config from a JSON file (config.json from a hub bundle)
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Head dimension
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Query projection width (heads × head_dim)
    pub fn q_dim(&self) -> usize {
        self.num_attention_heads * self.head_dim()
    }

    /// Key/value projection width (kv heads × head_dim)
    pub fn kv_dim(&self) -> usize {
        self.num_key_value_heads * self.head_dim()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 || self.num_hidden_layers == 0 {
            return Err(MappingError::Config(
                "num_attention_heads, num_key_value_heads and num_hidden_layers must be non-zero".to_string(),
            ));
        }
        if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return Err(MappingError::Config(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(MappingError::Config(format!(
                "num_attention_heads ({}) must be divisible by num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(MappingError::Config(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        Ok(())
    }

    /// Serialize as a pretty-printed `config.json` document
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Generation defaults written as `generation_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token_id: Option<TokenIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default = "default_do_sample")]
    pub do_sample: bool,
}

fn default_do_sample() -> bool { true }

impl From<&ModelDims> for GenerationConfig {
    fn from(dims: &ModelDims) -> Self {
        Self {
            bos_token_id: dims.bos_token_id.clone(),
            eos_token_id: dims.eos_token_id.clone(),
            do_sample: default_do_sample(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::Architecture;

    #[test]
    fn test_head_dim_defaults_to_ratio() {
        let mut dims = Architecture::Llama3_1_8B.hub_config();
        assert_eq!(dims.head_dim(), 128);
        dims.head_dim = None;
        assert_eq!(dims.head_dim(), 4096 / 32);
        dims.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_gqa() {
        let mut dims = Architecture::Qwen3_0_6B.hub_config();
        dims.num_key_value_heads = 5;
        assert!(matches!(dims.validate(), Err(MappingError::Config(_))));
    }

    #[test]
    fn test_json_file_roundtrip_keeps_hub_fields() {
        let dims = Architecture::Llama3_1_8B.hub_config();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, dims.to_json_pretty().unwrap()).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["architectures"][0], "LlamaForCausalLM");
        assert_eq!(raw["rope_scaling"]["rope_type"], "llama3");

        assert_eq!(ModelDims::from_json_file(&path).unwrap(), dims);
    }

    #[test]
    fn test_eos_token_list_is_accepted() {
        let mut raw = serde_json::to_value(Architecture::Llama3_1_8B.hub_config()).unwrap();
        raw["eos_token_id"] = serde_json::json!([128001, 128008, 128009]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, raw.to_string()).unwrap();

        let dims = ModelDims::from_json_file(&path).unwrap();
        assert_eq!(dims.bos_token_id, Some(TokenIds::Single(128000)));
        assert_eq!(dims.eos_token_id, Some(TokenIds::Many(vec![128001, 128008, 128009])));

        let generation = serde_json::to_value(GenerationConfig::from(&dims)).unwrap();
        assert_eq!(generation["eos_token_id"], serde_json::json!([128001, 128008, 128009]));
        assert_eq!(generation["bos_token_id"], 128000);
    }
}
