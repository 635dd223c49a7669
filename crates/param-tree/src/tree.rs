//! Path-addressed parameter trees
//!
//! The collaborator projects its model into a [`ParameterTree`] once per save
//! or restore call. Iteration follows the lexicographic order of paths, which
//! fixes the serialization order and lets restored values be matched back
//! onto a template by path.

use ckpt_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use std::sync::Arc;

use crate::tensor::Tensor;

/// One component of a parameter path
///
/// `Index` keys order before `Name` keys at the same position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathKey {
    Index(usize),
    Name(String),
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Index(i) => write!(f, "{}", i),
            PathKey::Name(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for PathKey {
    fn from(s: &str) -> Self {
        PathKey::Name(s.to_string())
    }
}

impl From<usize> for PathKey {
    fn from(i: usize) -> Self {
        PathKey::Index(i)
    }
}

/// Structured location of a tensor in the model
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamPath(Vec<PathKey>);

impl ParamPath {
    pub fn new(keys: Vec<PathKey>) -> Self {
        Self(keys)
    }

    /// Parse a dotted path; all-digit segments become indices
    pub fn parse(dotted: &str) -> Self {
        Self(
            dotted
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(|segment| match segment.parse::<usize>() {
                    Ok(i) if segment.bytes().all(|b| b.is_ascii_digit()) => PathKey::Index(i),
                    _ => PathKey::Name(segment.to_string()),
                })
                .collect(),
        )
    }

    pub fn keys(&self) -> &[PathKey] {
        &self.0
    }

    /// Extend the path by one key
    pub fn child(&self, key: impl Into<PathKey>) -> Self {
        let mut keys = self.0.clone();
        keys.push(key.into());
        Self(keys)
    }

    /// Whether any named key contains `needle`
    pub fn has_key_containing(&self, needle: &str) -> bool {
        self.0
            .iter()
            .any(|k| matches!(k, PathKey::Name(n) if n.contains(needle)))
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", keys.join("."))
    }
}

impl From<&str> for ParamPath {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}

/// Pure predicate deciding whether a path takes part in a save or restore
#[derive(Clone)]
pub struct PathFilter(Arc<dyn Fn(&ParamPath) -> bool + Send + Sync>);

impl PathFilter {
    pub fn new(f: impl Fn(&ParamPath) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Accept every path
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Accept paths with a named key containing `needle`
    pub fn contains_key(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new(move |path| path.has_key_containing(&needle))
    }

    /// Low-rank adapter parameters only
    pub fn lora() -> Self {
        Self::contains_key("lora")
    }

    /// Accept exactly the paths this filter rejects
    pub fn not(self) -> Self {
        Self::new(move |path| !(self.0)(path))
    }

    pub fn matches(&self, path: &ParamPath) -> bool {
        (self.0)(path)
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PathFilter(..)")
    }
}

/// Ordered mapping from path to tensor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTree {
    tensors: BTreeMap<ParamPath, Tensor>,
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor, returning the one previously stored at `path`
    pub fn insert(&mut self, path: impl Into<ParamPath>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(path.into(), tensor)
    }

    pub fn get(&self, path: &ParamPath) -> Option<&Tensor> {
        self.tensors.get(path)
    }

    pub fn contains(&self, path: &ParamPath) -> bool {
        self.tensors.contains_key(path)
    }

    pub fn remove(&mut self, path: &ParamPath) -> Option<Tensor> {
        self.tensors.remove(path)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensors in path order
    pub fn iter(&self) -> btree_map::Iter<'_, ParamPath, Tensor> {
        self.tensors.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &ParamPath> {
        self.tensors.keys()
    }

    /// New tree with only the paths accepted by `filter`, order preserved
    pub fn filter_paths(&self, filter: &PathFilter) -> ParameterTree {
        ParameterTree {
            tensors: self
                .tensors
                .iter()
                .filter(|(path, _)| filter.matches(path))
                .map(|(path, tensor)| (path.clone(), tensor.clone()))
                .collect(),
        }
    }

    /// Overwrite every path of `partial` in place
    ///
    /// All paths are checked before anything is replaced, so on
    /// [`Error::PathMismatch`] the tree is unchanged.
    pub fn merge_from(&mut self, partial: ParameterTree) -> Result<()> {
        if let Some(path) = partial.paths().find(|p| !self.contains(p)) {
            return Err(Error::PathMismatch {
                path: path.to_string(),
            });
        }
        self.tensors.extend(partial.tensors);
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ParameterTree {
    type Item = (&'a ParamPath, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, ParamPath, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.iter()
    }
}

impl FromIterator<(ParamPath, Tensor)> for ParameterTree {
    fn from_iter<I: IntoIterator<Item = (ParamPath, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Tree with only the paths accepted by `predicate`
pub fn filter_paths(tree: &ParameterTree, predicate: &PathFilter) -> ParameterTree {
    tree.filter_paths(predicate)
}

/// `base` with every path of `partial` overwritten
///
/// Fails with [`Error::PathMismatch`] if `partial` has a path `base` lacks.
pub fn merge(base: ParameterTree, partial: ParameterTree) -> Result<ParameterTree> {
    let mut merged = base;
    merged.merge_from(partial)?;
    Ok(merged)
}
