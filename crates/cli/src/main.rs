//! ShardConv command line driver
//!
//! ```bash
//! # Internal checkpoint → hub bundle
//! shardconv export --checkpoint-dir /data/ckpt --arch qwen3-0.6b
//!
//! # Hub bundle → internal checkpoint at step 0
//! shardconv import --bundle-dir ./Qwen3-0.6B --checkpoint-dir /data/ckpt --arch qwen3-0.6b
//!
//! # Narrow a checkpoint for inference
//! shardconv narrow --checkpoint-dir /data/ckpt --output-checkpoint-dir /data/ckpt-int8
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardconv_checkpoint::{
    CheckpointBackend, CheckpointManager, CheckpointOptions, LocalCheckpointBackend, PreemptionSignal,
    TrainState,
};
use shardconv_convert::{
    export_tree, import_bundle, BundleWriter, ConversionContext, TokenizerArtifacts,
    TokenizerSource, CONFIG_FILE,
};
use shardconv_core::{narrow_tree, ParameterTree, Precision};
use shardconv_mapping::{Architecture, Direction, MappingError, MappingRegistry, ModelDims};

use crate::config::ConvertConfig;

#[derive(Parser)]
#[command(name = "shardconv")]
#[command(author = "ShardConv Contributors")]
#[command(version)]
#[command(about = "Convert checkpoints between the stacked training layout and hub bundles")]
#[command(long_about = r#"
ShardConv

Walks an internal parameter tree and rewrites it as a hub bundle
(safetensors weights, config.json, generation_config.json, tokenizer),
imports a hub bundle back into a checkpoint, or narrows a checkpoint's
precision for inference.

Defaults come from SHARDCONV_ARCH, SHARDCONV_STACKED_LAYERS,
SHARDCONV_OUTPUT_DIR, SHARDCONV_NARROW, SHARDCONV_CHECKPOINT_DIR,
SHARDCONV_TOKENIZER_DIR, SHARDCONV_MAX_SHARD_BYTES and HF_AUTH_TOKEN.
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export an internal checkpoint step as a hub bundle
    Export {
        #[command(flatten)]
        model: ModelArgs,

        /// Checkpoint store root
        #[arg(short, long)]
        checkpoint_dir: Option<PathBuf>,

        /// Step to export (latest committed step by default)
        #[arg(long)]
        step: Option<u64>,

        /// Top-level key holding the parameters, e.g. `params`
        #[arg(long)]
        params_key: Option<String>,

        /// Bundle directory (defaults to <SHARDCONV_OUTPUT_DIR>/<arch>)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Local tokenizer directory, preferred over the hub
        #[arg(long)]
        tokenizer_dir: Option<PathBuf>,

        /// Write the bundle without tokenizer artifacts
        #[arg(long)]
        no_tokenizer: bool,

        /// Replace an existing bundle
        #[arg(long)]
        overwrite: bool,

        /// Maximum bytes per weight file
        #[arg(long)]
        max_shard_bytes: Option<usize>,
    },

    /// Import a hub bundle as an internal checkpoint
    Import {
        #[command(flatten)]
        model: ModelArgs,

        /// Hub bundle directory
        #[arg(short, long)]
        bundle_dir: PathBuf,

        /// Checkpoint store root
        #[arg(short, long)]
        checkpoint_dir: Option<PathBuf>,

        /// Step to save the imported parameters under
        #[arg(long, default_value_t = 0)]
        step: u64,
    },

    /// Narrow a checkpoint step and save it as step 0 of a new store
    Narrow {
        /// Source checkpoint store root
        #[arg(short, long)]
        checkpoint_dir: Option<PathBuf>,

        /// Step to narrow (latest committed step by default)
        #[arg(long)]
        step: Option<u64>,

        /// Destination checkpoint store root
        #[arg(short, long)]
        output_checkpoint_dir: PathBuf,

        /// Target precision: int8, bf16 or f16
        #[arg(short, long, value_parser = parse_precision)]
        precision: Option<Precision>,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Architecture key, e.g. llama3.1-8b or qwen3-0.6b
    #[arg(short, long)]
    arch: Option<String>,

    /// Hub config.json to use instead of the architecture preset
    #[arg(long)]
    config: Option<PathBuf>,

    /// Checkpoint keeps one tensor per layer instead of stacked layers
    #[arg(long)]
    per_layer: bool,

    /// Narrow tensors to int8, bf16 or f16 while converting
    #[arg(long, value_parser = parse_precision)]
    narrow: Option<Precision>,
}

fn parse_precision(s: &str) -> std::result::Result<Precision, String> {
    Precision::from_str(s).ok_or_else(|| format!("unknown precision '{}', expected int8, bf16 or f16", s))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardconv=info,shardconv_convert=info,shardconv_checkpoint=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ConvertConfig::from_env();

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, mut config: ConvertConfig) -> Result<()> {
    match command {
        Commands::Export {
            model,
            checkpoint_dir,
            step,
            params_key,
            output_dir,
            tokenizer_dir,
            no_tokenizer,
            overwrite,
            max_shard_bytes,
        } => {
            model.apply(&mut config);
            if let Some(dir) = checkpoint_dir {
                config.checkpoint_dir = dir;
            }
            if let Some(dir) = tokenizer_dir {
                config.tokenizer_dir = Some(dir);
            }
            if let Some(bytes) = max_shard_bytes {
                config.max_shard_bytes = bytes;
            }
            let output_dir = output_dir.unwrap_or_else(|| config.output_dir.join(&config.architecture));
            let ctx = conversion_context(&config, model.config.as_deref(), Direction::ToExternal)?;

            let manager = CheckpointManager::new(
                LocalCheckpointBackend::new(&config.checkpoint_dir)?,
                CheckpointOptions::default(),
            )?;
            let state = restore(&manager, step, &config.checkpoint_dir)?;
            let params = match params_key {
                Some(key) => state
                    .params
                    .into_subtree(&key)
                    .with_context(|| format!("checkpoint has no '{}' subtree", key))?,
                None => state.params,
            };
            info!(
                step = state.step,
                leaves = params.num_leaves(),
                params_billions = params.num_parameters() as f64 / 1e9,
                "Loaded parameter tree"
            );

            let tokenizer = if no_tokenizer {
                None
            } else {
                tokenizer_source(&config)
                    .map(|source| TokenizerArtifacts::load(&source))
                    .transpose()?
            };
            let writer = BundleWriter::new()
                .with_max_shard_bytes(config.max_shard_bytes)
                .with_overwrite(overwrite);
            let summary = export_tree(&params, &ctx, tokenizer, &writer, &output_dir)?;

            info!(
                path = %summary.output_dir.display(),
                files = summary.weight_files.len(),
                tensors = summary.num_tensors,
                "bundle written"
            );
        }

        Commands::Import {
            model,
            bundle_dir,
            checkpoint_dir,
            step,
        } => {
            model.apply(&mut config);
            if let Some(dir) = checkpoint_dir {
                config.checkpoint_dir = dir;
            }
            // The bundle carries its own dimensions unless overridden
            let config_path = model.config.clone().unwrap_or_else(|| bundle_dir.join(CONFIG_FILE));
            let ctx = conversion_context(&config, Some(&config_path), Direction::ToInternal)?;

            let params = import_bundle(&bundle_dir, &ctx)?;
            info!(
                leaves = params.num_leaves(),
                params_billions = params.num_parameters() as f64 / 1e9,
                "Imported parameter tree"
            );
            save_and_drain(&config.checkpoint_dir, step, params).await?;
        }

        Commands::Narrow {
            checkpoint_dir,
            step,
            output_checkpoint_dir,
            precision,
        } => {
            if let Some(dir) = checkpoint_dir {
                config.checkpoint_dir = dir;
            }
            let precision = precision.or(config.narrow_to).unwrap_or(Precision::Int8);

            let source = CheckpointManager::new(
                LocalCheckpointBackend::new(&config.checkpoint_dir)?,
                CheckpointOptions::default(),
            )?;
            let state = restore(&source, step, &config.checkpoint_dir)?;
            let narrowed = narrow_tree(&state.params, precision)?;
            info!(
                step = state.step,
                precision = ?precision,
                params_billions = narrowed.num_parameters() as f64 / 1e9,
                "Narrowed parameter tree"
            );
            save_and_drain(&output_checkpoint_dir, 0, narrowed).await?;
        }
    }
    Ok(())
}

impl ModelArgs {
    fn apply(&self, config: &mut ConvertConfig) {
        if let Some(arch) = &self.arch {
            config.architecture = arch.clone();
        }
        if self.per_layer {
            config.stacked_layers = false;
        }
        if self.narrow.is_some() {
            config.narrow_to = self.narrow;
        }
    }
}

/// Resolve dimensions and build the context; unknown keys fail here
fn conversion_context(
    config: &ConvertConfig,
    config_path: Option<&Path>,
    direction: Direction,
) -> Result<ConversionContext> {
    let registry = Arc::new(MappingRegistry::builtin());
    let dims = match config_path {
        Some(path) => ModelDims::from_json_file(path)
            .with_context(|| format!("reading model config {}", path.display()))?,
        None => match Architecture::from_str(&config.architecture) {
            Some(arch) => arch.hub_config(),
            None => {
                return Err(MappingError::UnknownArchitecture {
                    key: config.architecture.clone(),
                    missing: vec!["param", "shape", "hook"],
                    available: registry.keys(),
                }
                .into())
            }
        },
    };

    let ctx = ConversionContext::new(registry, &config.architecture, dims, direction)
        .with_stacked_layers(config.stacked_layers)
        .with_narrowing(config.narrow_to);
    // Surface registry and dimension errors before any I/O
    ctx.mapping()?;
    Ok(ctx)
}

fn tokenizer_source(config: &ConvertConfig) -> Option<TokenizerSource> {
    if let Some(dir) = &config.tokenizer_dir {
        return Some(TokenizerSource::Local(dir.clone()));
    }
    match Architecture::from_str(&config.architecture) {
        Some(arch) => Some(TokenizerSource::Hub {
            repo: arch.tokenizer_repo().to_string(),
            token: config.hf_token.clone(),
        }),
        None => {
            warn!(arch = %config.architecture, "No tokenizer repository known, writing bundle without tokenizer");
            None
        }
    }
}

fn restore<B: CheckpointBackend>(
    manager: &CheckpointManager<B>,
    step: Option<u64>,
    root: &Path,
) -> Result<TrainState> {
    match step {
        Some(step) => Ok(manager.restore(step)?),
        None => match manager.restore_latest()? {
            Some(state) => Ok(state),
            None => bail!("no committed checkpoint under {}", root.display()),
        },
    }
}

/// Save `params` under `step` and drain before returning
async fn save_and_drain(root: &Path, step: u64, params: ParameterTree) -> Result<()> {
    let signal = PreemptionSignal::new();
    let _listener = signal.listen();
    let manager = CheckpointManager::new(LocalCheckpointBackend::new(root)?, CheckpointOptions::default())?
        .with_preemption(signal);

    if !manager.save(step, TrainState::inference(step, params)).await? {
        warn!(step, path = %root.display(), "Checkpoint not saved");
    }
    if manager.reached_preemption(step) {
        manager.wait_until_finished().await?;
        info!(step, "Drained checkpoint after preemption");
        return Ok(());
    }
    manager.wait_until_finished().await?;
    info!(step, path = %root.display(), "Checkpoint saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_narrow_precision_flag() {
        let cli = Cli::try_parse_from(["shardconv", "narrow", "-o", "/tmp/out", "--precision", "bf16"]).unwrap();
        match cli.command {
            Commands::Narrow { precision, output_checkpoint_dir, step, .. } => {
                assert_eq!(precision, Some(Precision::BFloat16));
                assert_eq!(output_checkpoint_dir, PathBuf::from("/tmp/out"));
                assert_eq!(step, None);
            }
            _ => panic!("expected narrow"),
        }
        assert!(Cli::try_parse_from(["shardconv", "narrow", "-o", "x", "-p", "int4"]).is_err());
    }

    #[test]
    fn test_model_args_override_env_config() {
        let cli = Cli::try_parse_from([
            "shardconv", "import", "-b", "bundle", "-a", "qwen3-4b", "--per-layer", "--narrow", "int8",
        ])
        .unwrap();
        let Commands::Import { model, .. } = cli.command else {
            panic!("expected import");
        };
        let mut config = ConvertConfig::from_lookup(|_| None);
        model.apply(&mut config);
        assert_eq!(config.architecture, "qwen3-4b");
        assert!(!config.stacked_layers);
        assert_eq!(config.narrow_to, Some(Precision::Int8));
    }

    #[test]
    fn test_unknown_architecture_fails_before_io() {
        let mut config = ConvertConfig::from_lookup(|_| None);
        config.architecture = "gpt2".to_string();
        let err = conversion_context(&config, None, Direction::ToExternal).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MappingError>(),
            Some(MappingError::UnknownArchitecture { key, .. }) if key == "gpt2"
        ));
    }
}
