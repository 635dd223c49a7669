//! Device meshes and per-tensor sharding specifications
//!
//! A [`Mesh`] names the axes of the device grid supplied by the topology
//! provider. A [`ShardingSpec`] maps every tensor dimension to at most one
//! mesh axis; devices that agree on every used axis hold the same slice and
//! are replicas of each other. Replica 0 of each slice is its unique writer.

use ckpt_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

/// One named axis of a device mesh
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAxis {
    /// Axis name referenced by sharding specs
    pub name: String,

    /// Number of devices along this axis
    pub size: usize,
}

/// Named multi-dimensional arrangement of devices
///
/// Devices are numbered `0..device_count()` in row-major order over the axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mesh {
    axes: Vec<MeshAxis>,
}

impl Mesh {
    /// Create a mesh from `(axis name, device count)` pairs
    pub fn new<N: Into<String>>(axes: impl IntoIterator<Item = (N, usize)>) -> Result<Self> {
        let axes: Vec<MeshAxis> = axes
            .into_iter()
            .map(|(name, size)| MeshAxis {
                name: name.into(),
                size,
            })
            .collect();

        let mut seen = HashSet::new();
        for axis in &axes {
            if axis.name.is_empty() {
                return Err(Error::InvalidSharding {
                    message: "mesh axis names must be non-empty".to_string(),
                });
            }
            if axis.size == 0 {
                return Err(Error::InvalidSharding {
                    message: format!("mesh axis '{}' has size 0", axis.name),
                });
            }
            if !seen.insert(axis.name.as_str()) {
                return Err(Error::InvalidSharding {
                    message: format!("mesh axis '{}' appears more than once", axis.name),
                });
            }
        }

        Ok(Self { axes })
    }

    /// A mesh with no axes and exactly one device
    pub fn single_device() -> Self {
        Self { axes: Vec::new() }
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    /// Total number of devices
    pub fn device_count(&self) -> usize {
        self.axes.iter().map(|a| a.size).product()
    }

    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a.name == name)
    }

    pub fn axis_size(&self, name: &str) -> Option<usize> {
        self.axes.iter().find(|a| a.name == name).map(|a| a.size)
    }

    /// Coordinate of `device` along every axis
    pub fn device_coords(&self, device: usize) -> Vec<usize> {
        let mut coords = vec![0; self.axes.len()];
        let mut rest = device;
        for (i, axis) in self.axes.iter().enumerate().rev() {
            coords[i] = rest % axis.size;
            rest /= axis.size;
        }
        coords
    }

    /// Devices owned by one process of a group, as contiguous blocks
    ///
    /// A mesh with fewer devices than processes is local to every process.
    pub fn devices_for_process(&self, process_index: usize, process_count: usize) -> Vec<usize> {
        let devices = self.device_count();
        if process_count <= 1 || devices < process_count {
            return (0..devices).collect();
        }
        let start = process_index * devices / process_count;
        let end = (process_index + 1) * devices / process_count;
        (start..end).collect()
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes: Vec<String> = self
            .axes
            .iter()
            .map(|a| format!("{}={}", a.name, a.size))
            .collect();
        write!(f, "Mesh[{}]", axes.join(", "))
    }
}

/// Partitioning of a tensor's dimensions over a mesh
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardingSpec {
    mesh: Mesh,
    dims: Vec<Option<String>>,
}

impl ShardingSpec {
    /// Create a spec with one entry per tensor dimension (`None` = unsharded)
    ///
    /// Fails if an axis is unknown to the mesh or used for two dimensions.
    pub fn new(mesh: Mesh, dims: Vec<Option<String>>) -> Result<Self> {
        let mut used = HashSet::new();
        for axis in dims.iter().flatten() {
            if mesh.axis_index(axis).is_none() {
                return Err(Error::InvalidSharding {
                    message: format!("axis '{}' is not part of {}", axis, mesh),
                });
            }
            if !used.insert(axis.as_str()) {
                return Err(Error::InvalidSharding {
                    message: format!("axis '{}' is used by more than one dimension", axis),
                });
            }
        }
        Ok(Self { mesh, dims })
    }

    /// Convenience constructor from borrowed axis names
    pub fn from_axes(mesh: Mesh, dims: &[Option<&str>]) -> Result<Self> {
        Self::new(mesh, dims.iter().map(|d| d.map(str::to_string)).collect())
    }

    /// Every device holds the full tensor
    pub fn replicated(mesh: Mesh, rank: usize) -> Self {
        Self {
            mesh,
            dims: vec![None; rank],
        }
    }

    /// Unsharded tensor on a single device
    pub fn single_device(rank: usize) -> Self {
        Self::replicated(Mesh::single_device(), rank)
    }

    /// Re-run construction checks on a spec that was deserialized
    pub fn validated(self) -> Result<Self> {
        let mesh = Mesh::new(self.mesh.axes.into_iter().map(|a| (a.name, a.size)))?;
        Self::new(mesh, self.dims)
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn dims(&self) -> &[Option<String>] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_fully_replicated(&self) -> bool {
        self.dims.iter().all(Option::is_none)
    }

    /// Number of distinct shard slots
    pub fn num_shards(&self) -> usize {
        self.dims
            .iter()
            .flatten()
            .map(|axis| self.axis_size(axis))
            .product()
    }

    /// Fail unless the spec has one entry per dimension of `shape`
    pub fn check_shape(&self, shape: &[usize]) -> Result<()> {
        if shape.len() != self.dims.len() {
            return Err(Error::InvalidSharding {
                message: format!(
                    "spec {:?} has rank {} but shape {:?} has rank {}",
                    self.dims,
                    self.dims.len(),
                    shape,
                    shape.len()
                ),
            });
        }
        Ok(())
    }

    /// Shard slot held by `device`
    pub fn shard_ordinal(&self, device: usize) -> usize {
        let coords = self.mesh.device_coords(device);
        self.dims.iter().flatten().fold(0, |ordinal, axis| {
            let (index, size) = self.axis_position(axis);
            ordinal * size + coords[index]
        })
    }

    /// Replica index of `device` among the devices holding the same slot
    pub fn replica_id(&self, device: usize) -> usize {
        let coords = self.mesh.device_coords(device);
        let used: HashSet<&str> = self.dims.iter().flatten().map(String::as_str).collect();
        self.mesh
            .axes()
            .iter()
            .enumerate()
            .filter(|(_, axis)| !used.contains(axis.name.as_str()))
            .fold(0, |replica, (index, axis)| replica * axis.size + coords[index])
    }

    /// Global slice held by `device`
    pub fn shard_slices(&self, shape: &[usize], device: usize) -> Vec<Range<usize>> {
        self.slot_slices(shape, self.shard_ordinal(device))
    }

    /// Global slice of every shard slot, indexed by ordinal
    pub fn shard_grid(&self, shape: &[usize]) -> Vec<Vec<Range<usize>>> {
        (0..self.num_shards())
            .map(|ordinal| self.slot_slices(shape, ordinal))
            .collect()
    }

    fn slot_slices(&self, shape: &[usize], ordinal: usize) -> Vec<Range<usize>> {
        let mut coords = vec![0; self.dims.len()];
        let mut rest = ordinal;
        for (d, axis) in self.dims.iter().enumerate().rev() {
            if let Some(axis) = axis {
                let size = self.axis_size(axis);
                coords[d] = rest % size;
                rest /= size;
            }
        }

        self.dims
            .iter()
            .zip(shape)
            .zip(coords)
            .map(|((axis, &len), coord)| match axis {
                Some(axis) => partition_slice(len, self.axis_size(axis), coord),
                None => 0..len,
            })
            .collect()
    }

    fn axis_size(&self, axis: &str) -> usize {
        self.axis_position(axis).1
    }

    // Axis names were checked against the mesh at construction
    fn axis_position(&self, axis: &str) -> (usize, usize) {
        self.mesh
            .axis_index(axis)
            .map(|i| (i, self.mesh.axes[i].size))
            .unwrap_or((0, 1))
    }
}

impl fmt::Display for ShardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<&str> = self
            .dims
            .iter()
            .map(|d| d.as_deref().unwrap_or("-"))
            .collect();
        write!(f, "({}) on {}", dims.join(", "), self.mesh)
    }
}

/// Balanced split of `len` elements into `parts`; the first `len % parts` get one extra
fn partition_slice(len: usize, parts: usize, index: usize) -> Range<usize> {
    let base = len / parts;
    let remainder = len % parts;
    let start = index * base + index.min(remainder);
    let size = base + usize::from(index < remainder);
    start..start + size
}
