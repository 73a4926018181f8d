//! External → internal import
//!
//! The reverse of the leaf processor. Every external name must match one
//! entry, its shape is checked before the inverse hook runs, and per-layer
//! slices of stacked parameters are collected until the full stack exists.

use std::collections::BTreeMap;

use shardconv_core::{narrow, ParamNode, ParameterTree, Tensor, PATH_SEPARATOR};
use shardconv_mapping::{Direction, MappingSpec};
use tracing::{debug, info};

use crate::context::ConversionContext;
use crate::error::{ConvertError, Result};
use crate::processor::{check_shape, run_hook, single_match};

/// Collects per-layer slices of stacked internal parameters
#[derive(Debug, Default)]
pub struct StackAssembler {
    axis: usize,
    num_layers: usize,
    pending: BTreeMap<String, BTreeMap<usize, Tensor>>,
}

impl StackAssembler {
    pub fn new(axis: usize, num_layers: usize) -> Self {
        Self {
            axis,
            num_layers,
            pending: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, path: &str, layer: usize, tensor: Tensor) -> Result<()> {
        let slices = self.pending.entry(path.to_string()).or_default();
        if slices.insert(layer, tensor).is_some() {
            return Err(ConvertError::DuplicateTarget(format!("{} (layer {})", path, layer)));
        }
        Ok(())
    }

    /// Stack every collected parameter; all layers must be present
    pub fn finish(self) -> Result<Vec<(String, Tensor)>> {
        let mut out = Vec::with_capacity(self.pending.len());
        for (path, slices) in self.pending {
            let missing: Vec<usize> = (0..self.num_layers).filter(|i| !slices.contains_key(i)).collect();
            if !missing.is_empty() || slices.len() != self.num_layers {
                return Err(ConvertError::IncompleteStack { path, missing });
            }
            let ordered: Vec<Tensor> = slices.into_values().collect();
            out.push((path, Tensor::stack(&ordered, self.axis)?));
        }
        Ok(out)
    }
}

/// Map one external tensor to its internal path
///
/// Returns `None` when the tensor was handed to the assembler.
fn import_one(
    name: &str,
    tensor: Tensor,
    mapping: &MappingSpec,
    ctx: &ConversionContext,
    assembler: &mut Option<StackAssembler>,
) -> Result<Option<(String, Tensor)>> {
    let matched = single_match(name, mapping.match_external(name))?;
    let entry = matched.entry;

    check_shape(mapping, name, &tensor)?;
    let tensor = match mapping.hook_for(&entry.external) {
        Some(hook) => run_hook(hook, tensor)?,
        None => tensor,
    };
    let tensor = match ctx.narrow_to() {
        Some(precision) => narrow(&tensor, precision)?,
        None => tensor,
    };

    match (entry.is_stacked(), matched.layer, assembler.as_mut()) {
        (true, Some(layer), Some(assembler)) => {
            assembler.push(entry.internal.as_str(), layer, tensor)?;
            Ok(None)
        }
        (_, Some(layer), _) if entry.internal.is_layered() => Ok(Some((entry.internal.substitute(layer), tensor))),
        (false, None, _) => Ok(Some((entry.internal.as_str().to_string(), tensor))),
        _ => Err(ConvertError::Unmapped(name.to_string())),
    }
}

/// Rebuild the internal parameter tree from external named tensors
pub fn import_tensors<I>(tensors: I, ctx: &ConversionContext) -> Result<ParameterTree>
where
    I: IntoIterator<Item = (String, Tensor)>,
{
    ctx.expect_direction(Direction::ToInternal)?;
    let mapping = ctx.mapping()?;
    let mut assembler = mapping
        .stack_slicer()
        .map(|slicer| StackAssembler::new(slicer.axis, slicer.num_layers));

    let mut tree = ParameterTree::new();
    let mut imported = 0usize;
    for (name, tensor) in tensors {
        if let Some((path, tensor)) = import_one(&name, tensor, &mapping, ctx, &mut assembler)? {
            insert(&mut tree, &path, tensor)?;
        }
        imported += 1;
        debug!(name = %name, "Imported tensor");
    }
    if let Some(assembler) = assembler {
        for (path, tensor) in assembler.finish()? {
            insert(&mut tree, &path, tensor)?;
        }
    }

    info!(
        architecture = ctx.architecture(),
        tensors = imported,
        leaves = tree.num_leaves(),
        "Imported bundle"
    );
    Ok(tree)
}

fn insert(tree: &mut ParameterTree, path: &str, tensor: Tensor) -> Result<()> {
    let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    if tree.get(&segments).is_some() {
        return Err(ConvertError::DuplicateTarget(path.to_string()));
    }
    let owned: Vec<String> = segments.into_iter().map(str::to_string).collect();
    tree.insert(&owned, ParamNode::Tensor(tensor))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(v: f32) -> Tensor {
        Tensor::from_f32(vec![2], &[v, v]).unwrap()
    }

    #[test]
    fn test_assembler_stacks_in_layer_order() {
        let mut assembler = StackAssembler::new(0, 3);
        assembler.push("w", 2, slice(2.0)).unwrap();
        assembler.push("w", 0, slice(0.0)).unwrap();
        assembler.push("w", 1, slice(1.0)).unwrap();

        let out = assembler.finish().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.shape(), &[3, 2]);
        assert_eq!(out[0].1.to_f32_vec().unwrap(), vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_assembler_reports_missing_layers() {
        let mut assembler = StackAssembler::new(0, 4);
        assembler.push("w", 0, slice(0.0)).unwrap();
        assembler.push("w", 2, slice(2.0)).unwrap();
        match assembler.finish().unwrap_err() {
            ConvertError::IncompleteStack { path, missing } => {
                assert_eq!(path, "w");
                assert_eq!(missing, vec![1, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_assembler_rejects_repeated_layer() {
        let mut assembler = StackAssembler::new(0, 2);
        assembler.push("w", 0, slice(0.0)).unwrap();
        assert!(matches!(
            assembler.push("w", 0, slice(0.0)),
            Err(ConvertError::DuplicateTarget(_))
        ));
    }
}
