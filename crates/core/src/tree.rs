//! Nested parameter trees and the depth-first leaf walker

use std::collections::btree_map::{self, BTreeMap};

use crate::error::{CoreError, Result};
use crate::tensor::{ShardedTensor, Tensor};

/// Separator used when a leaf path is flattened into a single name
pub const PATH_SEPARATOR: &str = "/";

/// A node in a parameter tree
#[derive(Debug, Clone)]
pub enum ParamNode {
    /// A host tensor
    Tensor(Tensor),
    /// A tensor split across devices, gathered once when walked
    Sharded(ShardedTensor),
    /// A traversable mapping of named children
    Map(BTreeMap<String, ParamNode>),
    /// A value that is neither a tensor nor a mapping (strings, lists, ...)
    Unsupported(String),
}

impl From<Tensor> for ParamNode {
    fn from(t: Tensor) -> Self {
        ParamNode::Tensor(t)
    }
}

impl From<ShardedTensor> for ParamNode {
    fn from(t: ShardedTensor) -> Self {
        ParamNode::Sharded(t)
    }
}

/// One leaf produced by the walker
#[derive(Debug, Clone)]
pub struct LeafRecord {
    /// Path segments from the root
    pub path: Vec<String>,
    /// The (gathered) leaf tensor
    pub tensor: Tensor,
}

impl LeafRecord {
    /// Path joined with [`PATH_SEPARATOR`]
    pub fn joined_path(&self) -> String {
        self.path.join(PATH_SEPARATOR)
    }
}

/// An ordered nested mapping from path segments to tensors
#[derive(Debug, Clone, Default)]
pub struct ParameterTree {
    root: BTreeMap<String, ParamNode>,
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(root: BTreeMap<String, ParamNode>) -> Self {
        Self { root }
    }

    /// Build a tree from `a/b/c`-style names
    pub fn from_flat<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Tensor)>,
        S: AsRef<str>,
    {
        let mut tree = Self::new();
        for (name, tensor) in entries {
            let path: Vec<String> = name
                .as_ref()
                .split(PATH_SEPARATOR)
                .map(str::to_string)
                .collect();
            tree.insert(&path, ParamNode::Tensor(tensor))?;
        }
        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn root(&self) -> &BTreeMap<String, ParamNode> {
        &self.root
    }

    /// Insert a node, creating intermediate mappings
    pub fn insert(&mut self, path: &[String], node: ParamNode) -> Result<()> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| CoreError::structure(path, "an empty path"))?;

        let mut current = &mut self.root;
        for (depth, segment) in parents.iter().enumerate() {
            let child = current
                .entry(segment.clone())
                .or_insert_with(|| ParamNode::Map(BTreeMap::new()));
            current = match child {
                ParamNode::Map(children) => children,
                _ => return Err(CoreError::structure(&path[..=depth], "a leaf where a mapping is needed")),
            };
        }

        if current.contains_key(last) {
            return Err(CoreError::structure(path, "a duplicate entry"));
        }
        current.insert(last.clone(), node);
        Ok(())
    }

    /// Look up a node by path
    pub fn get(&self, path: &[&str]) -> Option<&ParamNode> {
        let (last, parents) = path.split_last()?;
        let mut current = &self.root;
        for segment in parents {
            match current.get(*segment)? {
                ParamNode::Map(children) => current = children,
                _ => return None,
            }
        }
        current.get(*last)
    }

    /// Detach the mapping stored under a top-level key (e.g. `params`)
    pub fn into_subtree(mut self, key: &str) -> Option<ParameterTree> {
        match self.root.remove(key)? {
            ParamNode::Map(root) => Some(Self { root }),
            _ => None,
        }
    }

    /// Lazily walk leaves in depth-first, key-ordered sequence
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            stack: vec![self.root.iter()],
            path: Vec::new(),
            done: false,
        }
    }

    /// Number of tensor leaves (without gathering)
    pub fn num_leaves(&self) -> usize {
        fn count(map: &BTreeMap<String, ParamNode>) -> usize {
            map.values()
                .map(|node| match node {
                    ParamNode::Tensor(_) | ParamNode::Sharded(_) => 1,
                    ParamNode::Map(children) => count(children),
                    ParamNode::Unsupported(_) => 0,
                })
                .sum()
        }
        count(&self.root)
    }

    /// Total element count across all tensor leaves (without gathering)
    pub fn num_parameters(&self) -> usize {
        fn count(map: &BTreeMap<String, ParamNode>) -> usize {
            map.values()
                .map(|node| match node {
                    ParamNode::Tensor(t) => t.numel(),
                    ParamNode::Sharded(s) => s.shards.iter().map(Tensor::numel).sum(),
                    ParamNode::Map(children) => count(children),
                    ParamNode::Unsupported(_) => 0,
                })
                .sum()
        }
        count(&self.root)
    }

    /// Flatten to `(joined path, tensor)` pairs in walk order
    pub fn flatten(&self) -> Result<Vec<(String, Tensor)>> {
        self.leaves()
            .map(|leaf| leaf.map(|l| (l.joined_path(), l.tensor)))
            .collect()
    }

    /// Rebuild the tree with every tensor transformed by `f`
    ///
    /// Sharded leaves are transformed shard by shard so placement survives.
    pub fn map_tensors<F>(&self, mut f: F) -> Result<ParameterTree>
    where
        F: FnMut(&[String], &Tensor) -> Result<Tensor>,
    {
        fn map_level<F>(
            map: &BTreeMap<String, ParamNode>,
            path: &mut Vec<String>,
            f: &mut F,
        ) -> Result<BTreeMap<String, ParamNode>>
        where
            F: FnMut(&[String], &Tensor) -> Result<Tensor>,
        {
            let mut out = BTreeMap::new();
            for (key, node) in map {
                path.push(key.clone());
                let mapped = match node {
                    ParamNode::Tensor(t) => ParamNode::Tensor(f(path, t)?),
                    ParamNode::Sharded(s) => {
                        let shards = s
                            .shards
                            .iter()
                            .map(|shard| f(path, shard))
                            .collect::<Result<Vec<_>>>()?;
                        ParamNode::Sharded(ShardedTensor::new(s.axis, shards))
                    }
                    ParamNode::Map(children) => ParamNode::Map(map_level(children, path, f)?),
                    ParamNode::Unsupported(kind) => return Err(CoreError::structure(path, kind.clone())),
                };
                path.pop();
                out.insert(key.clone(), mapped);
            }
            Ok(out)
        }

        let root = map_level(&self.root, &mut Vec::new(), &mut f)?;
        Ok(ParameterTree { root })
    }
}

/// Depth-first leaf iterator over a [`ParameterTree`]
///
/// Holds one map iterator per open level, so memory is bounded by tree depth
/// rather than leaf count. After yielding an error the iterator is fused.
pub struct Leaves<'a> {
    stack: Vec<btree_map::Iter<'a, String, ParamNode>>,
    path: Vec<String>,
    done: bool,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = Result<LeafRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let level = self.stack.last_mut()?;
            let Some((key, node)) = level.next() else {
                self.stack.pop();
                self.path.pop();
                continue;
            };

            match node {
                ParamNode::Map(children) => {
                    self.path.push(key.clone());
                    self.stack.push(children.iter());
                }
                ParamNode::Tensor(tensor) => {
                    return Some(Ok(LeafRecord {
                        path: self.leaf_path(key),
                        tensor: tensor.clone(),
                    }));
                }
                ParamNode::Sharded(sharded) => {
                    let path = self.leaf_path(key);
                    return Some(match sharded.gather() {
                        Ok(tensor) => Ok(LeafRecord { path, tensor }),
                        Err(e) => {
                            self.done = true;
                            Err(CoreError::structure(&path, format!("inconsistent shards ({})", e)))
                        }
                    });
                }
                ParamNode::Unsupported(kind) => {
                    self.done = true;
                    let path = self.leaf_path(key);
                    return Some(Err(CoreError::structure(&path, kind.clone())));
                }
            }
        }
    }
}

impl Leaves<'_> {
    fn leaf_path(&self, key: &str) -> Vec<String> {
        let mut path = self.path.clone();
        path.push(key.to_string());
        path
    }
}
