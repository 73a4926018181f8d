//! Resolved per-run mapping
//!
//! A [`MappingSpec`] is what the registry hands to the leaf processor: the
//! name pairs for one architecture and layout, the expected shape of every
//! concrete external name, and the hooks already oriented for the run's
//! direction.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{MappingError, Result};
use crate::hook::Hook;
use crate::pattern::NamePattern;

/// Conversion direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Internal parameter tree → hub bundle
    ToExternal,
    /// Hub bundle → internal parameter tree
    ToInternal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToExternal => f.write_str("internal->external"),
            Direction::ToInternal => f.write_str("external->internal"),
        }
    }
}

/// Slices the layer axis of a stacked leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlicer {
    pub axis: usize,
    pub num_layers: usize,
}

/// One internal ↔ external name pair
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub internal: NamePattern,
    pub external: NamePattern,
}

impl ParamEntry {
    /// Whether the internal leaf holds every layer along the stack axis
    pub fn is_stacked(&self) -> bool {
        self.external.is_layered() && !self.internal.is_layered()
    }
}

/// A matched entry with the layer index captured from the concrete name
#[derive(Debug, Clone, Copy)]
pub struct EntryMatch<'a> {
    pub entry: &'a ParamEntry,
    pub layer: Option<usize>,
}

/// The complete (param, shape, hook) triple for one architecture and layout
#[derive(Debug, Clone)]
pub struct MappingSpec {
    architecture: String,
    direction: Direction,
    entries: Vec<ParamEntry>,
    shapes: BTreeMap<String, Vec<usize>>,
    hooks: HashMap<String, Hook>,
    num_layers: usize,
    stack_slicer: Option<StackSlicer>,
}

impl MappingSpec {
    /// Assemble a spec from raw tables
    ///
    /// `params` pairs internal path patterns with external name patterns,
    /// `shapes` is keyed by external pattern and expanded over `num_layers`,
    /// `hooks` are given in the export direction and inverted for import.
    pub fn new(
        architecture: impl Into<String>,
        direction: Direction,
        num_layers: usize,
        stacked_layers: bool,
        params: Vec<(String, String)>,
        shapes: Vec<(String, Vec<usize>)>,
        hooks: Vec<(String, Hook)>,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(params.len());
        for (internal, external) in params {
            let entry = ParamEntry {
                internal: NamePattern::parse(&internal)?,
                external: NamePattern::parse(&external)?,
            };
            if entry.internal.is_layered() && !entry.external.is_layered() {
                return Err(MappingError::InvalidPattern(format!(
                    "'{}' is per-layer but its target '{}' has no layer index",
                    entry.internal, entry.external
                )));
            }
            if entry.internal.is_layered() && stacked_layers {
                return Err(MappingError::InvalidPattern(format!(
                    "'{}' carries a layer index in a stacked layout",
                    entry.internal
                )));
            }
            if entry.is_stacked() && !stacked_layers {
                return Err(MappingError::InvalidPattern(format!(
                    "'{}' has no layer index in a per-layer layout",
                    entry.internal
                )));
            }
            entries.push(entry);
        }

        let mut expanded = BTreeMap::new();
        for (pattern, shape) in shapes {
            for name in NamePattern::parse(&pattern)?.expand(num_layers) {
                expanded.insert(name, shape.clone());
            }
        }

        let hooks = hooks
            .into_iter()
            .map(|(pattern, hook)| match direction {
                Direction::ToExternal => (pattern, hook),
                Direction::ToInternal => (pattern, hook.inverted()),
            })
            .collect();

        let stack_slicer = stacked_layers.then_some(StackSlicer { axis: 0, num_layers });

        Ok(Self {
            architecture: architecture.into(),
            direction,
            entries,
            shapes: expanded,
            hooks,
            num_layers,
            stack_slicer,
        })
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    /// Present iff the internal layout stacks layers along a leading axis
    pub fn stack_slicer(&self) -> Option<StackSlicer> {
        self.stack_slicer
    }

    /// Transformer block count the mapping was resolved for
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Entries whose internal pattern matches a concrete internal path
    pub fn match_internal(&self, path: &str) -> Vec<EntryMatch<'_>> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .internal
                    .captures(path)
                    .map(|layer| EntryMatch { entry, layer })
            })
            .collect()
    }

    /// Entries whose external pattern matches a concrete external name
    pub fn match_external(&self, name: &str) -> Vec<EntryMatch<'_>> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .external
                    .captures(name)
                    .map(|layer| EntryMatch { entry, layer })
            })
            .collect()
    }

    /// Expected shape of a concrete external name
    pub fn expected_shape(&self, name: &str) -> Option<&[usize]> {
        self.shapes.get(name).map(Vec::as_slice)
    }

    /// Hook registered for an external pattern, oriented for this direction
    pub fn hook_for(&self, external: &NamePattern) -> Option<&Hook> {
        self.hooks.get(external.as_str())
    }

    /// Every concrete internal path a complete tree holds, in table order
    pub fn internal_paths(&self) -> Vec<String> {
        let layers = self.num_layers();
        self.entries
            .iter()
            .flat_map(|e| e.internal.expand(layers))
            .collect()
    }

    /// Every concrete external name a complete bundle holds, in table order
    pub fn external_names(&self) -> Vec<String> {
        let layers = self.num_layers();
        self.entries
            .iter()
            .flat_map(|e| e.external.expand(layers))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(stacked: bool, direction: Direction) -> MappingSpec {
        let internal = if stacked { "layer.weight" } else { "layer.{i}.weight" };
        MappingSpec::new(
            "toy",
            direction,
            2,
            stacked,
            vec![
                (internal.to_string(), "block.{i}.w".to_string()),
                ("head".to_string(), "lm.w".to_string()),
            ],
            vec![
                ("block.{i}.w".to_string(), vec![4, 4]),
                ("lm.w".to_string(), vec![4, 2]),
            ],
            vec![("lm.w".to_string(), Hook::new(vec![crate::hook::HookOp::Scale(2.0)]))],
        )
        .unwrap()
    }

    #[test]
    fn test_shapes_are_expanded() {
        let spec = toy(false, Direction::ToExternal);
        assert_eq!(spec.expected_shape("block.0.w"), Some(&[4, 4][..]));
        assert_eq!(spec.expected_shape("block.1.w"), Some(&[4, 4][..]));
        assert_eq!(spec.expected_shape("block.2.w"), None);
        assert!(spec.stack_slicer().is_none());
    }

    #[test]
    fn test_per_layer_match_captures_index() {
        let spec = toy(false, Direction::ToExternal);
        let matches = spec.match_internal("layer.1.weight");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].layer, Some(1));
        assert!(!matches[0].entry.is_stacked());
        assert!(spec.match_internal("layer.weight").is_empty());
        assert_eq!(spec.internal_paths(), vec!["layer.0.weight", "layer.1.weight", "head"]);
    }

    #[test]
    fn test_stacked_carries_slicer() {
        let spec = toy(true, Direction::ToExternal);
        assert_eq!(spec.stack_slicer(), Some(StackSlicer { axis: 0, num_layers: 2 }));
        let matches = spec.match_internal("layer.weight");
        assert_eq!(matches.len(), 1);
        assert!(matches[0].entry.is_stacked());
        assert_eq!(spec.external_names(), vec!["block.0.w", "block.1.w", "lm.w"]);
    }

    #[test]
    fn test_import_inverts_hooks() {
        let export = toy(false, Direction::ToExternal);
        let import = toy(false, Direction::ToInternal);
        let pattern = NamePattern::parse("lm.w").unwrap();
        assert_eq!(
            import.hook_for(&pattern).unwrap(),
            &export.hook_for(&pattern).unwrap().inverted()
        );
    }

    #[test]
    fn test_rejects_layered_internal_in_stacked_layout() {
        let err = MappingSpec::new(
            "toy",
            Direction::ToExternal,
            2,
            true,
            vec![("layer.{i}.weight".to_string(), "block.{i}.w".to_string())],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, MappingError::InvalidPattern(_)));
    }
}
