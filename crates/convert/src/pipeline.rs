//! End-to-end conversions

use std::collections::BTreeSet;
use std::path::Path;

use shardconv_core::ParameterTree;
use shardconv_mapping::Direction;
use tracing::{info, warn};

use crate::bundle::OutputBundle;
use crate::context::ConversionContext;
use crate::error::Result;
use crate::importer::import_tensors;
use crate::processor::process;
use crate::reader::BundleReader;
use crate::tokenizer::TokenizerArtifacts;
use crate::writer::{BundleWriter, WriteSummary};

/// Walk the tree and collect every processed leaf into a bundle
pub fn build_bundle(tree: &ParameterTree, ctx: &ConversionContext) -> Result<OutputBundle> {
    ctx.expect_direction(Direction::ToExternal)?;
    let mapping = ctx.mapping()?;

    let mut bundle = OutputBundle::new(ctx.dims().clone());
    for leaf in tree.leaves() {
        for (name, tensor) in process(leaf?, &mapping, ctx)? {
            bundle.insert(name, tensor)?;
        }
    }

    let produced: BTreeSet<&str> = bundle.tensors().keys().map(String::as_str).collect();
    let missing = mapping
        .external_names()
        .into_iter()
        .filter(|name| !produced.contains(name.as_str()))
        .count();
    if missing > 0 {
        warn!(missing, "Bundle does not cover every mapped parameter");
    }

    info!(
        architecture = ctx.architecture(),
        stacked_layers = ctx.stacked_layers(),
        tensors = bundle.len(),
        narrow = ?ctx.narrow_to(),
        "Converted parameter tree"
    );
    Ok(bundle)
}

/// Convert a parameter tree and write it as a hub bundle
pub fn export_tree(
    tree: &ParameterTree,
    ctx: &ConversionContext,
    tokenizer: Option<TokenizerArtifacts>,
    writer: &BundleWriter,
    output_dir: &Path,
) -> Result<WriteSummary> {
    let mut bundle = build_bundle(tree, ctx)?;
    if let Some(tokenizer) = tokenizer {
        let config_vocab = ctx.dims().vocab_size;
        if tokenizer.vocab_size() > config_vocab {
            warn!(
                tokenizer_vocab = tokenizer.vocab_size(),
                config_vocab,
                "Tokenizer vocabulary exceeds the model's embedding rows"
            );
        }
        bundle = bundle.with_tokenizer(tokenizer);
    }
    writer.write(&bundle, output_dir)
}

/// Read a hub bundle and rebuild the internal parameter tree
pub fn import_bundle(dir: &Path, ctx: &ConversionContext) -> Result<ParameterTree> {
    let reader = BundleReader::open(dir)?;
    if reader.config() != ctx.dims() {
        warn!(path = %dir.display(), "Bundle config.json differs from the configured model dimensions");
    }
    import_tensors(reader.tensors()?, ctx)
}
