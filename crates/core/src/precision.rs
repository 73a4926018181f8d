//! Precision narrowing for inference-only checkpoints
//!
//! Only tensors stored in the training-time wide format (F32) are narrowed.
//! Everything else passes through untouched: optimizer counters, integer
//! indices and tensors that were already narrowed. This makes [`narrow`]
//! idempotent, and the same function backs both the tree-wide pass that runs
//! before checkpoint persistence and the per-leaf pass of bundle export.
//!
//! Uses rayon for parallel conversion of large tensors.

use half::{bf16, f16};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::tensor::{DType, Tensor};
use crate::tree::ParameterTree;

/// Elements converted per rayon work item
const CHUNK_ELEMS: usize = 64 * 1024;

/// Target precision for narrowing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Saturating cast to signed 8-bit integers, truncating toward zero
    Int8,
    /// Brain float 16
    BFloat16,
    /// IEEE half precision
    Float16,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Precision::Int8 => DType::I8,
            Precision::BFloat16 => DType::BF16,
            Precision::Float16 => DType::F16,
        }
    }

    /// The precision a narrowed dtype came from, if any
    pub fn of_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::I8 => Some(Self::Int8),
            DType::BF16 => Some(Self::BFloat16),
            DType::F16 => Some(Self::Float16),
            _ => None,
        }
    }

    /// Parse precision from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "int8" | "i8" => Some(Self::Int8),
            "bf16" | "bfloat16" => Some(Self::BFloat16),
            "f16" | "fp16" | "float16" => Some(Self::Float16),
            _ => None,
        }
    }
}

/// Whether `narrow` would change this tensor
pub fn is_eligible(tensor: &Tensor) -> bool {
    tensor.dtype() == DType::F32
}

/// Narrow an F32 tensor to `precision`; other dtypes are returned unchanged
pub fn narrow(tensor: &Tensor, precision: Precision) -> Result<Tensor> {
    if !is_eligible(tensor) {
        return Ok(tensor.clone());
    }

    let src = tensor.as_bytes();
    let out_size = precision.dtype().size_bytes();
    let mut out = vec![0u8; tensor.numel() * out_size];

    out.par_chunks_mut(CHUNK_ELEMS * out_size)
        .zip(src.par_chunks(CHUNK_ELEMS * 4))
        .for_each(|(dst, src)| {
            for (d, s) in dst.chunks_exact_mut(out_size).zip(src.chunks_exact(4)) {
                let v = f32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                match precision {
                    // `as` saturates at the i8 bounds and maps NaN to zero
                    Precision::Int8 => d[0] = (v as i8) as u8,
                    Precision::BFloat16 => d.copy_from_slice(&bf16::from_f32(v).to_bits().to_le_bytes()),
                    Precision::Float16 => d.copy_from_slice(&f16::from_f32(v).to_bits().to_le_bytes()),
                }
            }
        });

    Tensor::from_bytes(tensor.shape().to_vec(), precision.dtype(), out)
        .map_err(|e| CoreError::InvalidTensor(format!("narrowing produced a bad buffer: {}", e)))
}

/// Decode a narrowed tensor back to F32; F32 is returned unchanged
///
/// Values computed on the widened tensor go back through [`narrow`], so an
/// element-wise transform of a narrowed tensor follows the same rule as
/// narrowing after the transform.
pub fn widen(tensor: &Tensor) -> Result<Tensor> {
    match tensor.dtype() {
        DType::F32 => Ok(tensor.clone()),
        DType::I8 => {
            let values: Vec<f32> = tensor.as_bytes().iter().map(|&b| b as i8 as f32).collect();
            Tensor::from_f32(tensor.shape().to_vec(), &values)
        }
        DType::BF16 | DType::F16 => Tensor::from_f32(tensor.shape().to_vec(), &tensor.to_f32_vec()?),
        other => Err(CoreError::UnsupportedDtype(format!("cannot widen {} tensor", other))),
    }
}

/// Narrow every eligible leaf of a tree, keeping its structure
pub fn narrow_tree(tree: &ParameterTree, precision: Precision) -> Result<ParameterTree> {
    let narrowed = tree.map_tensors(|_, t| narrow(t, precision))?;
    tracing::debug!(?precision, leaves = narrowed.num_leaves(), "Narrowed parameter tree");
    Ok(narrowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int8_truncates_and_saturates() {
        let t = Tensor::from_f32(vec![6], &[1.9, -1.9, 300.0, -300.0, 0.4, f32::NAN]).unwrap();
        let n = narrow(&t, Precision::Int8).unwrap();
        assert_eq!(n.dtype(), DType::I8);
        let values: Vec<i8> = n.as_bytes().iter().map(|&b| b as i8).collect();
        assert_eq!(values, vec![1, -1, 127, -128, 0, 0]);
    }

    #[test]
    fn test_narrow_is_idempotent() {
        let values: Vec<f32> = (0..200_000).map(|i| (i as f32 - 1000.0) * 0.37).collect();
        let t = Tensor::from_f32(vec![400, 500], &values).unwrap();
        for precision in [Precision::Int8, Precision::BFloat16, Precision::Float16] {
            let once = narrow(&t, precision).unwrap();
            let twice = narrow(&once, precision).unwrap();
            assert_eq!(once, twice);
            assert_eq!(once.shape(), &[400, 500]);
        }
    }

    #[test]
    fn test_non_float32_passes_through() {
        let counter = Tensor::from_i32(vec![1], &[42]).unwrap();
        assert_eq!(narrow(&counter, Precision::Int8).unwrap(), counter);

        let half = Tensor::from_f32_as(vec![2], &[0.5, 1.5], DType::BF16).unwrap();
        let out = narrow(&half, Precision::Float16).unwrap();
        assert_eq!(out.dtype(), DType::BF16);
    }

    #[test]
    fn test_bf16_close_to_source() {
        let t = Tensor::from_f32(vec![3], &[1.0, -2.5, 0.15625]).unwrap();
        let n = narrow(&t, Precision::BFloat16).unwrap();
        assert_eq!(n.to_f32_vec().unwrap(), vec![1.0, -2.5, 0.15625]);
    }

    #[test]
    fn test_widen_then_narrow_restores_narrowed() {
        let t = Tensor::from_f32(vec![4], &[3.7, -12.2, 126.9, 0.5]).unwrap();
        for precision in [Precision::Int8, Precision::BFloat16, Precision::Float16] {
            let narrowed = narrow(&t, precision).unwrap();
            assert_eq!(Precision::of_dtype(narrowed.dtype()), Some(precision));
            let wide = widen(&narrowed).unwrap();
            assert_eq!(wide.dtype(), DType::F32);
            assert_eq!(narrow(&wide, precision).unwrap(), narrowed);
        }
        let int8 = widen(&narrow(&t, Precision::Int8).unwrap()).unwrap();
        assert_eq!(int8.to_f32_vec().unwrap(), vec![3.0, -12.0, 126.0, 0.0]);
    }

    #[test]
    fn test_widen_rejects_integer_counters() {
        let counter = Tensor::from_i32(vec![1], &[7]).unwrap();
        assert!(matches!(widen(&counter), Err(CoreError::UnsupportedDtype(_))));
        assert_eq!(Precision::of_dtype(DType::I32), None);
    }

    #[test]
    fn test_precision_from_str() {
        assert_eq!(Precision::from_str("INT8"), Some(Precision::Int8));
        assert_eq!(Precision::from_str("bf16"), Some(Precision::BFloat16));
        assert_eq!(Precision::from_str("fp8"), None);
    }
}
