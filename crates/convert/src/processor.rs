//! Leaf processor (internal → external)
//!
//! One walker leaf becomes one or more named hub tensors: match a single
//! mapping entry, slice the layer axis of stacked leaves, run the hook,
//! narrow, then check the result against the declared shape.

use shardconv_core::{narrow, widen, LeafRecord, Precision, Tensor};
use shardconv_mapping::{EntryMatch, Hook, MappingSpec};
use tracing::debug;

use crate::context::ConversionContext;
use crate::error::{ConvertError, Result};

/// Convert one leaf into its `(target name, tensor)` outputs
pub fn process(
    leaf: LeafRecord,
    mapping: &MappingSpec,
    ctx: &ConversionContext,
) -> Result<Vec<(String, Tensor)>> {
    let path = leaf.joined_path();
    let matched = single_match(&path, mapping.match_internal(&path))?;
    let entry = matched.entry;

    let slices: Vec<(String, Tensor)> = match (entry.is_stacked(), mapping.stack_slicer()) {
        (true, Some(slicer)) => {
            let got = leaf.tensor.shape().get(slicer.axis).copied().unwrap_or(0);
            if got != slicer.num_layers {
                return Err(ConvertError::LayerCountMismatch {
                    path,
                    expected: slicer.num_layers,
                    got,
                });
            }
            (0..slicer.num_layers)
                .map(|i| Ok((entry.external.substitute(i), leaf.tensor.select(slicer.axis, i)?)))
                .collect::<Result<_>>()?
        }
        _ => {
            let name = match matched.layer {
                Some(i) => entry.external.substitute(i),
                None => entry.external.as_str().to_string(),
            };
            vec![(name, leaf.tensor)]
        }
    };

    let hook = mapping.hook_for(&entry.external);
    let mut outputs = Vec::with_capacity(slices.len());
    for (name, tensor) in slices {
        let tensor = match hook {
            Some(hook) => run_hook(hook, tensor)?,
            None => tensor,
        };
        let tensor = match ctx.narrow_to() {
            Some(precision) => narrow(&tensor, precision)?,
            None => tensor,
        };
        check_shape(mapping, &name, &tensor)?;
        outputs.push((name, tensor));
    }

    debug!(path = %path, outputs = outputs.len(), "Processed leaf");
    Ok(outputs)
}

/// Apply a hook, computing arithmetic on narrowed tensors in F32
///
/// The result is narrowed back to the input's precision with [`narrow`], the
/// rule the per-leaf pass applies after the hook.
pub(crate) fn run_hook(hook: &Hook, tensor: Tensor) -> Result<Tensor> {
    match Precision::of_dtype(tensor.dtype()) {
        Some(precision) if hook.changes_values() => {
            let wide = hook.apply(&widen(&tensor)?)?;
            Ok(narrow(&wide, precision)?)
        }
        _ => Ok(hook.apply(&tensor)?),
    }
}

/// Exactly one entry must match
pub(crate) fn single_match<'a>(name: &str, mut matches: Vec<EntryMatch<'a>>) -> Result<EntryMatch<'a>> {
    match matches.len() {
        0 => Err(ConvertError::Unmapped(name.to_string())),
        1 => Ok(matches.remove(0)),
        count => Err(ConvertError::AmbiguousPath {
            name: name.to_string(),
            count,
        }),
    }
}

/// Compare a tensor against the shape declared for a concrete external name
pub(crate) fn check_shape(mapping: &MappingSpec, name: &str, tensor: &Tensor) -> Result<()> {
    let expected = mapping
        .expected_shape(name)
        .ok_or_else(|| ConvertError::MissingShape(name.to_string()))?;
    if tensor.shape() != expected {
        return Err(ConvertError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            got: tensor.shape().to_vec(),
        });
    }
    Ok(())
}
