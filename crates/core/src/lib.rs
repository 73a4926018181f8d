//! ShardConv Core
//!
//! Host-side primitives shared by every conversion direction:
//! - Byte-backed tensors with the layout operations used by mapping hooks
//! - Sharded tensors gathered once per leaf
//! - Nested parameter trees and a lazy depth-first leaf walker
//! - Precision narrowing for inference checkpoints
//! - Safetensors encoding

pub mod error;
pub mod io;
pub mod precision;
pub mod tensor;
pub mod tree;

pub use error::{CoreError, Result};
pub use precision::{narrow, narrow_tree, widen, Precision};
pub use tensor::{DType, ShardedTensor, Tensor};
pub use tree::{LeafRecord, Leaves, ParamNode, ParameterTree, PATH_SEPARATOR};
