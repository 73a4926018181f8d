//! Mapping registry
//!
//! Three tables keyed by architecture key. The registry is built once and is
//! read-only afterwards; callers share it behind an `Arc` and pass it into the
//! conversion context.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::architecture::Architecture;
use crate::config::ModelDims;
use crate::error::{MappingError, Result};
use crate::spec::{Direction, MappingSpec};
use crate::tables::{ArchitectureTables, HookTableFn, ParamTableFn, ShapeTableFn};

#[derive(Clone, Default)]
pub struct MappingRegistry {
    params: HashMap<String, ParamTableFn>,
    shapes: HashMap<String, ShapeTableFn>,
    hooks: HashMap<String, HookTableFn>,
}

impl std::fmt::Debug for MappingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl MappingRegistry {
    /// Registry holding every built-in architecture
    pub fn builtin() -> Self {
        let mut builder = Self::builder();
        for arch in Architecture::ALL {
            builder = builder.register(arch.key(), arch.tables());
        }
        builder.build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Keys present in all three tables, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .params
            .keys()
            .filter(|k| self.shapes.contains_key(*k) && self.hooks.contains_key(*k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Resolve the complete mapping for one run
    ///
    /// Fails before any tensor is touched when `key` is absent from any of
    /// the three tables.
    pub fn resolve(
        &self,
        key: &str,
        stacked_layers: bool,
        dims: &ModelDims,
        direction: Direction,
    ) -> Result<MappingSpec> {
        let (params, shapes, hooks) = match (self.params.get(key), self.shapes.get(key), self.hooks.get(key)) {
            (Some(p), Some(s), Some(h)) => (p, s, h),
            (p, s, h) => {
                let missing = [("param", p.is_none()), ("shape", s.is_none()), ("hook", h.is_none())]
                    .into_iter()
                    .filter_map(|(table, absent)| absent.then_some(table))
                    .collect();
                return Err(MappingError::UnknownArchitecture {
                    key: key.to_string(),
                    missing,
                    available: self.keys(),
                });
            }
        };

        dims.validate()?;
        let spec = MappingSpec::new(
            key,
            direction,
            dims.num_hidden_layers,
            stacked_layers,
            params(dims, stacked_layers),
            shapes(dims),
            hooks(dims),
        )?;
        debug!(
            architecture = key,
            stacked_layers,
            %direction,
            entries = spec.entries().len(),
            "Resolved mapping"
        );
        Ok(spec)
    }
}

/// Builder for [`MappingRegistry`]
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: MappingRegistry,
    keys: BTreeSet<String>,
}

impl RegistryBuilder {
    /// Register a complete triple
    pub fn register(self, key: &str, tables: ArchitectureTables) -> Self {
        self.register_params(key, tables.params)
            .register_shapes(key, tables.shapes)
            .register_hooks(key, tables.hooks)
    }

    pub fn register_params(mut self, key: &str, table: ParamTableFn) -> Self {
        self.keys.insert(key.to_string());
        self.registry.params.insert(key.to_string(), table);
        self
    }

    pub fn register_shapes(mut self, key: &str, table: ShapeTableFn) -> Self {
        self.keys.insert(key.to_string());
        self.registry.shapes.insert(key.to_string(), table);
        self
    }

    pub fn register_hooks(mut self, key: &str, table: HookTableFn) -> Self {
        self.keys.insert(key.to_string());
        self.registry.hooks.insert(key.to_string(), table);
        self
    }

    pub fn build(self) -> MappingRegistry {
        for key in &self.keys {
            if !self.registry.keys().contains(key) {
                debug!(key = %key, "Architecture registered with an incomplete table triple");
            }
        }
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::LLAMA3;

    #[test]
    fn test_builtin_keys() {
        let registry = MappingRegistry::builtin();
        let keys = registry.keys();
        assert_eq!(keys.len(), Architecture::ALL.len());
        for arch in Architecture::ALL {
            assert!(keys.contains(&arch.key().to_string()));
        }
    }

    #[test]
    fn test_unknown_key_lists_available() {
        let registry = MappingRegistry::builtin();
        let dims = Architecture::Llama3_1_8B.hub_config();
        let err = registry
            .resolve("gpt2", true, &dims, Direction::ToExternal)
            .unwrap_err();
        match err {
            MappingError::UnknownArchitecture { key, missing, available } => {
                assert_eq!(key, "gpt2");
                assert_eq!(missing, vec!["param", "shape", "hook"]);
                assert_eq!(available, registry.keys());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_asymmetric_registration_is_unknown() {
        let registry = MappingRegistry::builder()
            .register_params("half", LLAMA3.params)
            .register_shapes("half", LLAMA3.shapes)
            .build();
        let dims = Architecture::Llama3_1_8B.hub_config();
        let err = registry
            .resolve("half", false, &dims, Direction::ToExternal)
            .unwrap_err();
        assert!(matches!(
            err,
            MappingError::UnknownArchitecture { ref missing, ref available, .. }
                if missing == &vec!["hook"] && available.is_empty()
        ));
    }
}
