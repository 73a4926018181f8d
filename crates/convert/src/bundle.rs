//! Output bundle accumulated during an export run

use std::collections::BTreeMap;

use shardconv_core::{DType, Tensor};
use shardconv_mapping::{GenerationConfig, ModelDims};

use crate::error::{ConvertError, Result};
use crate::tokenizer::TokenizerArtifacts;

/// Flat name → tensor map plus the documents written next to it
#[derive(Debug, Clone)]
pub struct OutputBundle {
    tensors: BTreeMap<String, Tensor>,
    config: ModelDims,
    generation: GenerationConfig,
    tokenizer: Option<TokenizerArtifacts>,
}

impl OutputBundle {
    pub fn new(config: ModelDims) -> Self {
        let generation = GenerationConfig::from(&config);
        Self {
            tensors: BTreeMap::new(),
            config,
            generation,
            tokenizer: None,
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: TokenizerArtifacts) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Add a tensor; every name is produced at most once
    pub fn insert(&mut self, name: String, tensor: Tensor) -> Result<()> {
        if self.tensors.contains_key(&name) {
            return Err(ConvertError::DuplicateTarget(name));
        }
        self.tensors.insert(name, tensor);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn tensors(&self) -> &BTreeMap<String, Tensor> {
        &self.tensors
    }

    pub fn config(&self) -> &ModelDims {
        &self.config
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    pub fn tokenizer(&self) -> Option<&TokenizerArtifacts> {
        self.tokenizer.as_ref()
    }

    pub fn total_bytes(&self) -> usize {
        self.tensors.values().map(Tensor::size_bytes).sum()
    }

    pub fn num_parameters(&self) -> usize {
        self.tensors.values().map(Tensor::numel).sum()
    }

    /// Dtype holding the most bytes in the bundle
    pub fn dominant_dtype(&self) -> Option<DType> {
        let mut bytes: BTreeMap<DType, usize> = BTreeMap::new();
        for tensor in self.tensors.values() {
            *bytes.entry(tensor.dtype()).or_insert(0) += tensor.size_bytes();
        }
        bytes
            .into_iter()
            .max_by_key(|(_, size)| *size)
            .map(|(dtype, _)| dtype)
    }

    /// `config.json` contents, with `torch_dtype` taken from the tensors
    pub fn config_document(&self) -> ModelDims {
        let mut config = self.config.clone();
        if let Some(dtype) = self.dominant_dtype() {
            config.torch_dtype = dtype.torch_name().to_string();
        }
        config
    }
}
