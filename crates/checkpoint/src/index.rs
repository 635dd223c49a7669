//! Generation 2 checkpoint index
//!
//! `<step>/index` is a JSON document listing every stored tensor with its
//! dtype, shape and sharding, and the artifact holding each shard slot.
//! Shard artifacts live under `<step>/shards/` as raw little-endian bytes.

use chrono::{DateTime, Utc};
use ckpt_core::{CustomMetadata, Error, FormatGeneration, Result, Step};
use param_tree::layout::{intersect, slice_volume};
use param_tree::{DType, Mesh, MeshAxis, ParamPath, ParameterTree, ShardingSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

use crate::record::CheckpointRecord;

/// Name of the index document inside a step directory
pub const INDEX_FILE: &str = "index";

/// Directory holding shard artifacts inside a step directory
pub const SHARDS_DIR: &str = "shards";

/// Artifact name of shard slot `shard` of the `tensor`-th stored tensor
pub fn shard_file(tensor: usize, shard: usize) -> String {
    format!("{}/{:05}-{:05}.bin", SHARDS_DIR, tensor, shard)
}

/// Serialized index of a sharded checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub format_generation: u32,
    pub step: Step,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub custom_metadata: CustomMetadata,
    pub tensors: Vec<TensorEntry>,
}

/// One stored tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub path: ParamPath,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub sharding: ShardingEntry,
    pub shards: Vec<ShardEntry>,
}

/// Sharding of a stored tensor, with the mesh it was saved on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingEntry {
    pub mesh: Vec<MeshAxis>,
    pub dims: Vec<Option<String>>,
}

/// One stored shard slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardEntry {
    /// Global `[start, end)` range per dimension
    pub slices: Vec<[usize; 2]>,
    /// Artifact path relative to the step directory
    pub file: String,
    pub num_bytes: u64,
}

/// Reader-facing description of a stored tensor, shared by every generation
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub sharding: ShardingSpec,
    pub shards: Vec<ShardDescriptor>,
}

/// Reader-facing description of one stored shard
#[derive(Debug, Clone, PartialEq)]
pub struct ShardDescriptor {
    pub slices: Vec<Range<usize>>,
    pub file: String,
    pub num_bytes: u64,
}

impl CheckpointIndex {
    /// Index of `tree` described by `record`, built from tensor metadata alone
    pub fn build(record: &CheckpointRecord, tree: &ParameterTree) -> Self {
        let tensors = tree
            .iter()
            .enumerate()
            .map(|(ordinal, (path, tensor))| {
                let elem_size = tensor.dtype().size_in_bytes() as u64;
                let shards = tensor
                    .sharding()
                    .shard_grid(tensor.shape())
                    .into_iter()
                    .enumerate()
                    .map(|(slot, slices)| ShardEntry {
                        num_bytes: slice_volume(&slices) as u64 * elem_size,
                        slices: slices.iter().map(|r| [r.start, r.end]).collect(),
                        file: shard_file(ordinal, slot),
                    })
                    .collect();

                TensorEntry {
                    path: path.clone(),
                    dtype: tensor.dtype(),
                    shape: tensor.shape().to_vec(),
                    sharding: ShardingEntry {
                        mesh: tensor.sharding().mesh().axes().to_vec(),
                        dims: tensor.sharding().dims().to_vec(),
                    },
                    shards,
                }
            })
            .collect();

        Self {
            format_generation: FormatGeneration::Sharded.as_u32(),
            step: record.step,
            created_at: record.created_at,
            custom_metadata: record.custom_metadata.clone(),
            tensors,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse an index read from `location`
    pub fn from_json(location: &str, bytes: &[u8]) -> Result<Self> {
        let index: Self = serde_json::from_slice(bytes).map_err(|e| Error::CorruptIndex {
            location: location.to_string(),
            reason: e.to_string(),
        })?;
        if index.format_generation != FormatGeneration::Sharded.as_u32() {
            return Err(Error::CorruptIndex {
                location: location.to_string(),
                reason: format!(
                    "expected format generation {}, found {}",
                    FormatGeneration::Sharded.as_u32(),
                    index.format_generation
                ),
            });
        }
        Ok(index)
    }

    /// Every artifact the index references
    pub fn artifacts(&self) -> impl Iterator<Item = &str> {
        self.tensors
            .iter()
            .flat_map(|t| t.shards.iter().map(|s| s.file.as_str()))
    }

    /// Split into the checkpoint record and validated tensor descriptors
    pub fn into_parts(self, location: &str) -> Result<(CheckpointRecord, BTreeMap<ParamPath, TensorDescriptor>)> {
        let mut entries = BTreeMap::new();
        for entry in self.tensors {
            let path = entry.path.clone();
            let descriptor = entry.into_descriptor().map_err(|e| Error::CorruptIndex {
                location: location.to_string(),
                reason: format!("{}: {}", path, e),
            })?;
            if entries.insert(path.clone(), descriptor).is_some() {
                return Err(Error::CorruptIndex {
                    location: location.to_string(),
                    reason: format!("{} is listed twice", path),
                });
            }
        }

        let record = CheckpointRecord {
            step: self.step,
            paths_written: entries.keys().cloned().collect(),
            format_generation: FormatGeneration::Sharded,
            custom_metadata: self.custom_metadata,
            created_at: self.created_at,
        };
        Ok((record, entries))
    }
}

impl TensorEntry {
    fn into_descriptor(self) -> Result<TensorDescriptor> {
        let mesh = Mesh::new(self.sharding.mesh.into_iter().map(|axis| (axis.name, axis.size)))?;
        let sharding = ShardingSpec::new(mesh, self.sharding.dims)?;
        sharding.check_shape(&self.shape)?;

        let elem_size = self.dtype.size_in_bytes() as u64;
        let shards = self
            .shards
            .into_iter()
            .map(|shard| {
                let slices: Vec<Range<usize>> = shard.slices.iter().map(|[s, e]| *s..*e).collect();
                let in_bounds = slices.len() == self.shape.len()
                    && slices
                        .iter()
                        .zip(&self.shape)
                        .all(|(r, &len)| r.start <= r.end && r.end <= len);
                if !in_bounds {
                    return Err(Error::InvalidTensor {
                        message: format!("shard {} covers {:?} outside shape {:?}", shard.file, slices, self.shape),
                    });
                }
                let expected = slice_volume(&slices) as u64 * elem_size;
                if shard.num_bytes != expected {
                    return Err(Error::InvalidTensor {
                        message: format!(
                            "shard {} declares {} bytes, its slice needs {}",
                            shard.file, shard.num_bytes, expected
                        ),
                    });
                }
                Ok(ShardDescriptor {
                    slices,
                    file: shard.file,
                    num_bytes: shard.num_bytes,
                })
            })
            .collect::<Result<Vec<ShardDescriptor>>>()?;

        // Restore counts copied elements, which is only sound for disjoint shards
        for (i, a) in shards.iter().enumerate() {
            for b in &shards[i + 1..] {
                if intersect(&a.slices, &b.slices).is_some() {
                    return Err(Error::InvalidTensor {
                        message: format!("shards {} and {} overlap", a.file, b.file),
                    });
                }
            }
        }

        Ok(TensorDescriptor {
            dtype: self.dtype,
            shape: self.shape,
            sharding,
            shards,
        })
    }
}

/// Generation declared by an index document, if it has one
pub fn declared_generation(bytes: &[u8]) -> Option<u64> {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()?
        .get("format_generation")?
        .as_u64()
}
