//! Supported model architectures
//!
//! The set is sealed: every variant carries its own hub configuration preset,
//! tokenizer repository and mapping tables, so a known variant can never be
//! missing one of them. Unknown keys only exist as strings and fail once, in
//! [`crate::MappingRegistry::resolve`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{ModelDims, TokenIds};
use crate::tables::{self, ArchitectureTables};

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// Llama 3.1 8B
    Llama3_1_8B,
    /// Llama 3.1 70B
    Llama3_1_70B,
    /// Qwen 3 0.6B (tied embeddings)
    Qwen3_0_6B,
    /// Qwen 3 4B (tied embeddings)
    Qwen3_4B,
    /// Qwen 3 8B
    Qwen3_8B,
}

/// Layout family shared by several sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Llama3,
    Qwen3,
}

impl Architecture {
    pub const ALL: [Architecture; 5] = [
        Self::Llama3_1_8B,
        Self::Llama3_1_70B,
        Self::Qwen3_0_6B,
        Self::Qwen3_4B,
        Self::Qwen3_8B,
    ];

    /// Registry key
    pub fn key(&self) -> &'static str {
        match self {
            Self::Llama3_1_8B => "llama3.1-8b",
            Self::Llama3_1_70B => "llama3.1-70b",
            Self::Qwen3_0_6B => "qwen3-0.6b",
            Self::Qwen3_4B => "qwen3-4b",
            Self::Qwen3_8B => "qwen3-8b",
        }
    }

    /// Parse architecture from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "llama3.1-8b" | "llama-3.1-8b" | "llama3_1_8b" => Some(Self::Llama3_1_8B),
            "llama3.1-70b" | "llama-3.1-70b" | "llama3_1_70b" => Some(Self::Llama3_1_70B),
            "qwen3-0.6b" | "qwen-3-0.6b" | "qwen3_0_6b" => Some(Self::Qwen3_0_6B),
            "qwen3-4b" | "qwen-3-4b" | "qwen3_4b" => Some(Self::Qwen3_4B),
            "qwen3-8b" | "qwen-3-8b" | "qwen3_8b" => Some(Self::Qwen3_8B),
            _ => None,
        }
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Llama3_1_8B | Self::Llama3_1_70B => ModelFamily::Llama3,
            Self::Qwen3_0_6B | Self::Qwen3_4B | Self::Qwen3_8B => ModelFamily::Qwen3,
        }
    }

    /// Hub repository the tokenizer artifacts are fetched from
    pub fn tokenizer_repo(&self) -> &'static str {
        match self {
            Self::Llama3_1_8B => "meta-llama/Llama-3.1-8B",
            Self::Llama3_1_70B => "meta-llama/Llama-3.1-70B",
            Self::Qwen3_0_6B => "Qwen/Qwen3-0.6B",
            Self::Qwen3_4B => "Qwen/Qwen3-4B",
            Self::Qwen3_8B => "Qwen/Qwen3-8B",
        }
    }

    /// The (param, shape, hook) table triple for this architecture
    pub fn tables(&self) -> ArchitectureTables {
        match self.family() {
            ModelFamily::Llama3 => tables::LLAMA3,
            ModelFamily::Qwen3 => tables::QWEN3,
        }
    }

    /// Hub `config.json` preset
    pub fn hub_config(&self) -> ModelDims {
        match self {
            Self::Llama3_1_8B => llama3_1(4096, 14336, 32, 32),
            Self::Llama3_1_70B => llama3_1(8192, 28672, 64, 80),
            Self::Qwen3_0_6B => qwen3(1024, 3072, 16, 28, 40960, true),
            Self::Qwen3_4B => qwen3(2560, 9728, 32, 36, 40960, true),
            Self::Qwen3_8B => qwen3(4096, 12288, 32, 36, 40960, false),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

fn llama3_1(hidden: usize, intermediate: usize, heads: usize, layers: usize) -> ModelDims {
    ModelDims {
        architectures: vec!["LlamaForCausalLM".to_string()],
        model_type: "llama".to_string(),
        hidden_size: hidden,
        intermediate_size: intermediate,
        num_attention_heads: heads,
        num_key_value_heads: 8,
        num_hidden_layers: layers,
        vocab_size: 128256,
        head_dim: Some(128),
        max_position_embeddings: 131072,
        rms_norm_eps: 1e-5,
        rope_theta: 500000.0,
        rope_scaling: Some(json!({
            "factor": 8.0,
            "low_freq_factor": 1.0,
            "high_freq_factor": 4.0,
            "original_max_position_embeddings": 8192,
            "rope_type": "llama3"
        })),
        tie_word_embeddings: false,
        attention_bias: false,
        hidden_act: "silu".to_string(),
        bos_token_id: Some(TokenIds::Single(128000)),
        eos_token_id: Some(TokenIds::Single(128001)),
        torch_dtype: "bfloat16".to_string(),
    }
}

fn qwen3(
    hidden: usize,
    intermediate: usize,
    heads: usize,
    layers: usize,
    max_positions: usize,
    tied: bool,
) -> ModelDims {
    ModelDims {
        architectures: vec!["Qwen3ForCausalLM".to_string()],
        model_type: "qwen3".to_string(),
        hidden_size: hidden,
        intermediate_size: intermediate,
        num_attention_heads: heads,
        num_key_value_heads: 8,
        num_hidden_layers: layers,
        vocab_size: 151936,
        head_dim: Some(128),
        max_position_embeddings: max_positions,
        rms_norm_eps: 1e-6,
        rope_theta: 1000000.0,
        rope_scaling: None,
        tie_word_embeddings: tied,
        attention_bias: false,
        hidden_act: "silu".to_string(),
        bos_token_id: Some(TokenIds::Single(151643)),
        eos_token_id: Some(TokenIds::Single(151645)),
        torch_dtype: "bfloat16".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_parse_back() {
        for arch in Architecture::ALL {
            assert_eq!(Architecture::from_str(arch.key()), Some(arch));
        }
        assert_eq!(Architecture::from_str("LLAMA-3.1-70B"), Some(Architecture::Llama3_1_70B));
        assert_eq!(Architecture::from_str("gpt2"), None);
    }

    #[test]
    fn test_presets_are_valid() {
        for arch in Architecture::ALL {
            let dims = arch.hub_config();
            dims.validate().unwrap();
            assert!(!dims.architectures.is_empty());
        }
        assert!(Architecture::Qwen3_0_6B.hub_config().tie_word_embeddings);
        assert!(!Architecture::Qwen3_8B.hub_config().tie_word_embeddings);
    }
}
