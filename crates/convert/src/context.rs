//! Per-run conversion context

use std::sync::Arc;

use shardconv_core::Precision;
use shardconv_mapping::{Direction, MappingRegistry, MappingSpec, ModelDims};

use crate::error::{ConvertError, Result};

/// Immutable configuration for one conversion run
#[derive(Debug, Clone)]
pub struct ConversionContext {
    registry: Arc<MappingRegistry>,
    architecture: String,
    stacked_layers: bool,
    dims: ModelDims,
    narrow_to: Option<Precision>,
    direction: Direction,
}

impl ConversionContext {
    /// Create a context with stacked layers and no narrowing
    pub fn new(
        registry: Arc<MappingRegistry>,
        architecture: impl Into<String>,
        dims: ModelDims,
        direction: Direction,
    ) -> Self {
        Self {
            registry,
            architecture: architecture.into(),
            stacked_layers: true,
            dims,
            narrow_to: None,
            direction,
        }
    }

    pub fn with_stacked_layers(mut self, stacked: bool) -> Self {
        self.stacked_layers = stacked;
        self
    }

    pub fn with_narrowing(mut self, precision: Option<Precision>) -> Self {
        self.narrow_to = precision;
        self
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn stacked_layers(&self) -> bool {
        self.stacked_layers
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn narrow_to(&self) -> Option<Precision> {
        self.narrow_to
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Resolve the mapping for this run from the registry
    pub fn mapping(&self) -> Result<MappingSpec> {
        Ok(self
            .registry
            .resolve(&self.architecture, self.stacked_layers, &self.dims, self.direction)?)
    }

    pub(crate) fn expect_direction(&self, expected: Direction) -> Result<()> {
        if self.direction != expected {
            return Err(ConvertError::WrongDirection {
                expected,
                got: self.direction,
            });
        }
        Ok(())
    }
}
