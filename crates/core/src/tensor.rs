//! Host tensor types and the layout operations used by conversion hooks
//!
//! Tensors are stored as raw little-endian bytes in row-major order, the same
//! layout safetensors uses on disk. Layout operations (permute, select,
//! stack, concat) work on bytes and never look at element values; arithmetic
//! operations (scale, add) round-trip floating types through f32.

use std::fmt;
use std::sync::Arc;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Tensor data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I8,
    U8,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 | DType::U8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }

    /// Name used by hub configuration documents (`torch_dtype`)
    pub fn torch_name(&self) -> &'static str {
        match self {
            DType::F64 => "float64",
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::I64 => "int64",
            DType::I32 => "int32",
            DType::I8 => "int8",
            DType::U8 => "uint8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.torch_name())
    }
}

impl TryFrom<safetensors::Dtype> for DType {
    type Error = CoreError;

    fn try_from(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F64 => Ok(DType::F64),
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            safetensors::Dtype::I64 => Ok(DType::I64),
            safetensors::Dtype::I32 => Ok(DType::I32),
            safetensors::Dtype::I8 => Ok(DType::I8),
            safetensors::Dtype::U8 => Ok(DType::U8),
            other => Err(CoreError::UnsupportedDtype(format!("{:?}", other))),
        }
    }
}

impl From<DType> for safetensors::Dtype {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::F64 => safetensors::Dtype::F64,
            DType::F32 => safetensors::Dtype::F32,
            DType::F16 => safetensors::Dtype::F16,
            DType::BF16 => safetensors::Dtype::BF16,
            DType::I64 => safetensors::Dtype::I64,
            DType::I32 => safetensors::Dtype::I32,
            DType::I8 => safetensors::Dtype::I8,
            DType::U8 => safetensors::Dtype::U8,
        }
    }
}

/// A dense host tensor
///
/// The byte buffer is reference counted so that pass-through conversions and
/// tree clones do not copy weight data.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Arc<Vec<u8>>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Tensor {
    /// Create a tensor from raw little-endian bytes
    pub fn from_bytes(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if data.len() != expected {
            return Err(CoreError::InvalidTensor(format!(
                "shape {:?} with dtype {} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            shape,
            dtype,
            data: Arc::new(data),
        })
    }

    /// Create an F32 tensor from values
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Self::from_f32_as(shape, values, DType::F32)
    }

    /// Create a floating tensor of the given dtype from f32 values
    pub fn from_f32_as(shape: Vec<usize>, values: &[f32], dtype: DType) -> Result<Self> {
        let data: Vec<u8> = match dtype {
            DType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::F64 => values.iter().flat_map(|&v| (v as f64).to_le_bytes()).collect(),
            DType::BF16 => values
                .iter()
                .flat_map(|&v| bf16::from_f32(v).to_bits().to_le_bytes())
                .collect(),
            DType::F16 => values
                .iter()
                .flat_map(|&v| f16::from_f32(v).to_bits().to_le_bytes())
                .collect(),
            other => {
                return Err(CoreError::UnsupportedDtype(format!(
                    "cannot build {} tensor from floating values",
                    other
                )))
            }
        };
        Self::from_bytes(shape, dtype, data)
    }

    /// Create an I32 tensor from values
    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(shape, DType::I32, data)
    }

    /// A zero-filled tensor
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_bytes();
        Self {
            shape,
            dtype,
            data: Arc::new(vec![0u8; len]),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Get size in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Decode floating elements to f32
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let bytes = self.as_bytes();
        let values = match self.dtype {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DType::F64 => bytes
                .chunks_exact(8)
                .map(|b| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    f64::from_le_bytes(raw) as f32
                })
                .collect(),
            DType::BF16 => bytes
                .chunks_exact(2)
                .map(|b| bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            DType::F16 => bytes
                .chunks_exact(2)
                .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            other => {
                return Err(CoreError::UnsupportedDtype(format!(
                    "{} tensor has no floating representation",
                    other
                )))
            }
        };
        Ok(values)
    }

    /// Reinterpret the shape without moving data
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self> {
        if shape.iter().product::<usize>() != self.numel() {
            return Err(CoreError::ShapeOp(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        Ok(Self {
            shape,
            dtype: self.dtype,
            data: Arc::clone(&self.data),
        })
    }

    /// Reorder axes; `axes[k]` is the source axis that becomes output axis `k`
    pub fn permute(&self, axes: &[usize]) -> Result<Self> {
        let rank = self.shape.len();
        let mut seen = vec![false; rank];
        if axes.len() != rank || axes.iter().any(|&a| a >= rank || std::mem::replace(&mut seen[a], true)) {
            return Err(CoreError::ShapeOp(format!(
                "invalid permutation {:?} for shape {:?}",
                axes, self.shape
            )));
        }
        if axes.iter().enumerate().all(|(k, &a)| k == a) {
            return Ok(self.clone());
        }

        let esize = self.dtype.size_bytes();
        let src_strides = row_major_strides(&self.shape);
        let out_shape: Vec<usize> = axes.iter().map(|&a| self.shape[a]).collect();
        let numel = self.numel();
        let src = self.as_bytes();
        let mut out = vec![0u8; src.len()];

        let mut index = vec![0usize; rank];
        for dst in 0..numel {
            let offset: usize = index
                .iter()
                .zip(axes)
                .map(|(&i, &a)| i * src_strides[a])
                .sum();
            out[dst * esize..(dst + 1) * esize]
                .copy_from_slice(&src[offset * esize..(offset + 1) * esize]);

            // Advance the output multi-index (row-major)
            for k in (0..rank).rev() {
                index[k] += 1;
                if index[k] < out_shape[k] {
                    break;
                }
                index[k] = 0;
            }
        }

        Self::from_bytes(out_shape, self.dtype, out)
    }

    /// Swap the two axes of a matrix
    pub fn transpose_2d(&self) -> Result<Self> {
        if self.shape.len() != 2 {
            return Err(CoreError::ShapeOp(format!(
                "transpose expects a 2D tensor, got {:?}",
                self.shape
            )));
        }
        self.permute(&[1, 0])
    }

    /// Take index `index` along `axis`, dropping that axis
    pub fn select(&self, axis: usize, index: usize) -> Result<Self> {
        if axis >= self.shape.len() || index >= self.shape[axis] {
            return Err(CoreError::ShapeOp(format!(
                "index {} on axis {} out of range for shape {:?}",
                index, axis, self.shape
            )));
        }
        let outer: usize = self.shape[..axis].iter().product();
        let dim = self.shape[axis];
        let inner = self.shape[axis + 1..].iter().product::<usize>() * self.dtype.size_bytes();

        let src = self.as_bytes();
        let mut out = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            let start = (o * dim + index) * inner;
            out.extend_from_slice(&src[start..start + inner]);
        }

        let mut out_shape = self.shape.clone();
        out_shape.remove(axis);
        Self::from_bytes(out_shape, self.dtype, out)
    }

    /// Stack equally shaped tensors along a new axis
    pub fn stack(tensors: &[Tensor], axis: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| CoreError::ShapeOp("cannot stack zero tensors".to_string()))?;
        if axis > first.shape.len() {
            return Err(CoreError::ShapeOp(format!(
                "stack axis {} out of range for shape {:?}",
                axis, first.shape
            )));
        }
        let expanded: Vec<Tensor> = tensors
            .iter()
            .map(|t| {
                let mut s = t.shape.clone();
                s.insert(axis, 1);
                t.reshape(s)
            })
            .collect::<Result<_>>()?;
        Self::concat(&expanded, axis)
    }

    /// Concatenate tensors along an existing axis
    pub fn concat(tensors: &[Tensor], axis: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| CoreError::ShapeOp("cannot concatenate zero tensors".to_string()))?;
        let rank = first.shape.len();
        if axis >= rank {
            return Err(CoreError::ShapeOp(format!(
                "concat axis {} out of range for shape {:?}",
                axis, first.shape
            )));
        }
        for t in tensors {
            let compatible = t.dtype == first.dtype
                && t.shape.len() == rank
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(k, (a, b))| k == axis || a == b);
            if !compatible {
                return Err(CoreError::ShapeOp(format!(
                    "cannot concatenate {} {:?} with {} {:?} on axis {}",
                    t.dtype, t.shape, first.dtype, first.shape, axis
                )));
            }
        }

        let outer: usize = first.shape[..axis].iter().product();
        let inner = first.shape[axis + 1..].iter().product::<usize>() * first.dtype.size_bytes();
        let total_dim: usize = tensors.iter().map(|t| t.shape[axis]).sum();

        let mut out = Vec::with_capacity(outer * total_dim * inner);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[axis] * inner;
                out.extend_from_slice(&t.as_bytes()[o * chunk..(o + 1) * chunk]);
            }
        }

        let mut out_shape = first.shape.clone();
        out_shape[axis] = total_dim;
        Self::from_bytes(out_shape, first.dtype, out)
    }

    /// Apply an element-wise function to a floating tensor, keeping its dtype
    pub fn map_float(&self, f: impl Fn(f32) -> f32) -> Result<Self> {
        if !self.dtype.is_float() {
            return Err(CoreError::UnsupportedDtype(format!(
                "element-wise arithmetic on {} tensor",
                self.dtype
            )));
        }
        let values: Vec<f32> = self.to_f32_vec()?.into_iter().map(f).collect();
        Self::from_f32_as(self.shape.clone(), &values, self.dtype)
    }
}

/// A logical tensor split along one axis across devices
#[derive(Debug, Clone)]
pub struct ShardedTensor {
    /// Axis the shards are split along
    pub axis: usize,
    /// Per-device shards, in device order
    pub shards: Vec<Tensor>,
}

impl ShardedTensor {
    pub fn new(axis: usize, shards: Vec<Tensor>) -> Self {
        Self { axis, shards }
    }

    /// Split a tensor into `num_shards` equal pieces along `axis`
    pub fn split(tensor: &Tensor, axis: usize, num_shards: usize) -> Result<Self> {
        if axis >= tensor.shape().len() || num_shards == 0 || tensor.shape()[axis] % num_shards != 0 {
            return Err(CoreError::ShapeOp(format!(
                "cannot split {:?} into {} shards on axis {}",
                tensor.shape(),
                num_shards,
                axis
            )));
        }
        let shard_size = tensor.shape()[axis] / num_shards;
        let mut shards = Vec::with_capacity(num_shards);
        for shard_id in 0..num_shards {
            let pieces: Vec<Tensor> = (shard_id * shard_size..(shard_id + 1) * shard_size)
                .map(|i| tensor.select(axis, i))
                .collect::<Result<_>>()?;
            shards.push(Tensor::stack(&pieces, axis)?);
        }
        Ok(Self { axis, shards })
    }

    /// Logical shape of the gathered tensor (None if shards disagree)
    pub fn logical_shape(&self) -> Option<Vec<usize>> {
        let first = self.shards.first()?;
        let mut shape = first.shape().to_vec();
        if self.axis >= shape.len() {
            return None;
        }
        shape[self.axis] = 0;
        for shard in &self.shards {
            if shard.dtype() != first.dtype() || shard.shape().len() != shape.len() {
                return None;
            }
            for (k, (&a, &b)) in shard.shape().iter().zip(first.shape()).enumerate() {
                if k != self.axis && a != b {
                    return None;
                }
            }
            shape[self.axis] += shard.shape()[self.axis];
        }
        Some(shape)
    }

    /// Materialize the full tensor on the host
    pub fn gather(&self) -> Result<Tensor> {
        if self.logical_shape().is_none() {
            return Err(CoreError::InvalidTensor(format!(
                "{} shards disagree on dtype or non-shard dimensions",
                self.shards.len()
            )));
        }
        if self.shards.len() == 1 {
            return Ok(self.shards[0].clone());
        }
        Tensor::concat(&self.shards, self.axis)
    }
}

/// Element strides of a row-major layout
fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
