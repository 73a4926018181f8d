//! Environment-driven conversion settings

use std::path::PathBuf;

use shardconv_convert::DEFAULT_MAX_SHARD_BYTES;
use shardconv_core::Precision;

/// Conversion settings read from the environment
///
/// Command line flags override each field.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertConfig {
    /// Registry key of the model architecture
    pub architecture: String,

    /// Whether internal checkpoints keep one tensor per stacked layer group
    pub stacked_layers: bool,

    /// Root directory for exported hub bundles
    pub output_dir: PathBuf,

    /// Precision to narrow tensors to, if any
    pub narrow_to: Option<Precision>,

    /// Root directory of the internal checkpoint store
    pub checkpoint_dir: PathBuf,

    /// Hub access token
    pub hf_token: Option<String>,

    /// Local directory holding tokenizer artifacts, preferred over the hub
    pub tokenizer_dir: Option<PathBuf>,

    /// Maximum bytes per weight file
    pub max_shard_bytes: usize,
}

impl ConvertConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            architecture: lookup("SHARDCONV_ARCH").unwrap_or_else(|| "llama3.1-8b".to_string()),
            stacked_layers: lookup("SHARDCONV_STACKED_LAYERS")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(true),
            output_dir: lookup("SHARDCONV_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_output_dir(lookup("HOME"))),
            narrow_to: lookup("SHARDCONV_NARROW").and_then(|s| Precision::from_str(&s)),
            checkpoint_dir: lookup("SHARDCONV_CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("checkpoints")),
            hf_token: lookup("HF_AUTH_TOKEN").filter(|s| !s.is_empty()),
            tokenizer_dir: lookup("SHARDCONV_TOKENIZER_DIR").map(PathBuf::from),
            max_shard_bytes: lookup("SHARDCONV_MAX_SHARD_BYTES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_SHARD_BYTES),
        }
    }
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_output_dir(home: Option<String>) -> PathBuf {
    match home {
        Some(home) => PathBuf::from(home).join(".hub_output"),
        None => PathBuf::from(".hub_output"),
    }
}
