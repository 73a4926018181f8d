//! Per-tensor transform hooks
//!
//! A hook is an ordered list of pure tensor operations. Hooks are declared in
//! the export direction (internal layout → hub layout); the import direction
//! uses [`Hook::inverted`], which reverses the list and inverts each step.

use shardconv_core::Tensor;

use crate::error::{MappingError, Result};

/// One tensor operation
#[derive(Debug, Clone, PartialEq)]
pub enum HookOp {
    /// Swap the axes of a matrix
    Transpose2d,
    /// Reorder axes; `axes[k]` is the source axis of output axis `k`
    Permute(Vec<usize>),
    /// Reinterpret `from` as `to` (the input must have shape `from`)
    Reshape { from: Vec<usize>, to: Vec<usize> },
    /// Multiply every element
    Scale(f32),
    /// Add a constant to every element
    AddScalar(f32),
}

impl HookOp {
    pub fn apply(&self, tensor: &Tensor) -> Result<Tensor> {
        let out = match self {
            HookOp::Transpose2d => tensor.transpose_2d()?,
            HookOp::Permute(axes) => tensor.permute(axes)?,
            HookOp::Reshape { from, to } => {
                if tensor.shape() != from.as_slice() {
                    return Err(MappingError::Config(format!(
                        "reshape hook expects {:?}, got {:?}",
                        from,
                        tensor.shape()
                    )));
                }
                tensor.reshape(to.clone())?
            }
            HookOp::Scale(factor) => {
                let factor = *factor;
                tensor.map_float(|v| v * factor)?
            }
            HookOp::AddScalar(offset) => {
                let offset = *offset;
                tensor.map_float(|v| v + offset)?
            }
        };
        Ok(out)
    }

    pub fn inverse(&self) -> HookOp {
        match self {
            HookOp::Transpose2d => HookOp::Transpose2d,
            HookOp::Permute(axes) => {
                let mut inverse = vec![0; axes.len()];
                for (k, &a) in axes.iter().enumerate() {
                    if let Some(slot) = inverse.get_mut(a) {
                        *slot = k;
                    }
                }
                HookOp::Permute(inverse)
            }
            HookOp::Reshape { from, to } => HookOp::Reshape {
                from: to.clone(),
                to: from.clone(),
            },
            HookOp::Scale(factor) => HookOp::Scale(1.0 / factor),
            HookOp::AddScalar(offset) => HookOp::AddScalar(-offset),
        }
    }
}

/// An ordered composition of [`HookOp`]s
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hook {
    ops: Vec<HookOp>,
}

impl Hook {
    pub fn new(ops: Vec<HookOp>) -> Self {
        Self { ops }
    }

    pub fn then(mut self, op: HookOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[HookOp] {
        &self.ops
    }

    /// Whether any op does arithmetic on element values
    pub fn changes_values(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, HookOp::Scale(_) | HookOp::AddScalar(_)))
    }

    pub fn apply(&self, tensor: &Tensor) -> Result<Tensor> {
        let mut current = tensor.clone();
        for op in &self.ops {
            current = op.apply(&current)?;
        }
        Ok(current)
    }

    /// The hook that undoes this one
    pub fn inverted(&self) -> Hook {
        Hook {
            ops: self.ops.iter().rev().map(HookOp::inverse).collect(),
        }
    }

    /// Matrix `[rows, cols]` stored for `x @ W` becomes `[cols, rows]`
    pub fn transpose() -> Hook {
        Hook::new(vec![HookOp::Transpose2d])
    }

    /// Attention input projection `[emb, heads, head_dim]` → `[heads*head_dim, emb]`
    pub fn fuse_heads_in(emb: usize, heads: usize, head_dim: usize) -> Hook {
        Hook::new(vec![
            HookOp::Reshape {
                from: vec![emb, heads, head_dim],
                to: vec![emb, heads * head_dim],
            },
            HookOp::Transpose2d,
        ])
    }

    /// Attention output projection `[heads, head_dim, emb]` → `[emb, heads*head_dim]`
    pub fn fuse_heads_out(heads: usize, head_dim: usize, emb: usize) -> Hook {
        Hook::new(vec![
            HookOp::Reshape {
                from: vec![heads, head_dim, emb],
                to: vec![heads * head_dim, emb],
            },
            HookOp::Transpose2d,
        ])
    }

    /// Rows of `[heads*head_dim, emb]` from interleaved rotary pairs to split halves
    pub fn rope_interleaved_to_halves(heads: usize, head_dim: usize, emb: usize) -> Hook {
        let half = head_dim / 2;
        Hook::new(vec![
            HookOp::Reshape {
                from: vec![heads * head_dim, emb],
                to: vec![heads, half, 2, emb],
            },
            HookOp::Permute(vec![0, 2, 1, 3]),
            HookOp::Reshape {
                from: vec![heads, 2, half, emb],
                to: vec![heads * head_dim, emb],
            },
        ])
    }

    /// Concatenate two hooks
    pub fn chain(mut self, other: Hook) -> Hook {
        self.ops.extend(other.ops);
        self
    }
}
