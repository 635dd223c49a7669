//! Sharded tensors
//!
//! A [`Tensor`] only holds the shards addressable by the local process. The
//! full logical value exists once all shard slots are gathered.

use bytes::Bytes;
use ckpt_core::{Error, Result};
use std::collections::HashSet;
use std::ops::Range;

use crate::dtype::DType;
use crate::layout::{copy_region, elem_count, full_slices, slice_volume};
use crate::mesh::ShardingSpec;

/// The slice of a tensor held by one device
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    device: usize,
    slices: Vec<Range<usize>>,
    data: Bytes,
}

impl Shard {
    pub fn new(device: usize, slices: Vec<Range<usize>>, data: Bytes) -> Self {
        Self {
            device,
            slices,
            data,
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    /// Global index ranges covered by this shard
    pub fn slices(&self) -> &[Range<usize>] {
        &self.slices
    }

    /// Row-major little-endian bytes of the slice
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Immutable, possibly sharded, n-dimensional array
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    sharding: ShardingSpec,
    shards: Vec<Shard>,
}

impl Tensor {
    /// Partition a full value over every device of the sharding's mesh
    pub fn from_global(dtype: DType, shape: Vec<usize>, sharding: ShardingSpec, data: Bytes) -> Result<Self> {
        let devices: Vec<usize> = (0..sharding.mesh().device_count()).collect();
        Self::from_global_on(dtype, shape, sharding, data, &devices)
    }

    /// Partition a full value, keeping only the shards of `devices`
    pub fn from_global_on(
        dtype: DType,
        shape: Vec<usize>,
        sharding: ShardingSpec,
        data: Bytes,
        devices: &[usize],
    ) -> Result<Self> {
        sharding.check_shape(&shape)?;
        let expected = elem_count(&shape) * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(Error::InvalidTensor {
                message: format!(
                    "{} tensor of shape {:?} needs {} bytes, got {}",
                    dtype,
                    shape,
                    expected,
                    data.len()
                ),
            });
        }

        let full = full_slices(&shape);
        let shards = devices
            .iter()
            .map(|&device| {
                check_device(&sharding, device)?;
                let slices = sharding.shard_slices(&shape, device);
                if slices == full {
                    return Ok(Shard::new(device, slices, data.clone()));
                }
                let mut buf = vec![0u8; slice_volume(&slices) * dtype.size_in_bytes()];
                copy_region(&data, &full, &mut buf, &slices, &slices, dtype.size_in_bytes());
                Ok(Shard::new(device, slices, Bytes::from(buf)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dtype,
            shape,
            sharding,
            shards,
        })
    }

    /// Assemble a tensor from shards that were built elsewhere
    pub fn from_shards(dtype: DType, shape: Vec<usize>, sharding: ShardingSpec, shards: Vec<Shard>) -> Result<Self> {
        sharding.check_shape(&shape)?;
        let mut devices = HashSet::new();
        for shard in &shards {
            check_device(&sharding, shard.device)?;
            if !devices.insert(shard.device) {
                return Err(Error::InvalidTensor {
                    message: format!("device {} holds two shards", shard.device),
                });
            }
            let expected_slices = sharding.shard_slices(&shape, shard.device);
            if shard.slices != expected_slices {
                return Err(Error::InvalidTensor {
                    message: format!(
                        "shard on device {} covers {:?}, sharding {} assigns {:?}",
                        shard.device, shard.slices, sharding, expected_slices
                    ),
                });
            }
            let expected_bytes = slice_volume(&shard.slices) * dtype.size_in_bytes();
            if shard.data.len() != expected_bytes {
                return Err(Error::InvalidTensor {
                    message: format!(
                        "shard on device {} has {} bytes, expected {}",
                        shard.device,
                        shard.data.len(),
                        expected_bytes
                    ),
                });
            }
        }
        Ok(Self {
            dtype,
            shape,
            sharding,
            shards,
        })
    }

    /// Build an f32 tensor over every device of the sharding's mesh
    pub fn from_f32(shape: Vec<usize>, sharding: ShardingSpec, values: &[f32]) -> Result<Self> {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_global(DType::F32, shape, sharding, Bytes::from(data))
    }

    /// Gathered value of an f32 tensor
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.dtype != DType::F32 {
            return Err(Error::InvalidTensor {
                message: format!("expected an f32 tensor, found {}", self.dtype),
            });
        }
        let data = self.gather()?;
        Ok(data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn sharding(&self) -> &ShardingSpec {
        &self.sharding
    }

    /// Locally addressable shards
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn elem_count(&self) -> usize {
        elem_count(&self.shape)
    }

    /// Devices holding a local shard
    pub fn devices(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.device).collect()
    }

    /// Whether the local shards cover every shard slot
    pub fn is_fully_addressable(&self) -> bool {
        let ordinals: HashSet<usize> = self
            .shards
            .iter()
            .map(|s| self.sharding.shard_ordinal(s.device))
            .collect();
        ordinals.len() == self.sharding.num_shards()
    }

    /// Materialise the full logical value from the local shards
    pub fn gather(&self) -> Result<Bytes> {
        let full = full_slices(&self.shape);
        if let Some(shard) = self.shards.iter().find(|s| s.slices == full) {
            return Ok(shard.data.clone());
        }
        if !self.is_fully_addressable() {
            return Err(Error::ShardCoverage {
                message: format!(
                    "{} local shards of {} do not cover {} shard slots",
                    self.shards.len(),
                    self.sharding,
                    self.sharding.num_shards()
                ),
            });
        }

        let elem_size = self.dtype.size_in_bytes();
        let mut buf = vec![0u8; self.elem_count() * elem_size];
        let mut seen = HashSet::new();
        for shard in &self.shards {
            // replicas carry identical data
            if !seen.insert(self.sharding.shard_ordinal(shard.device)) {
                continue;
            }
            copy_region(&shard.data, &shard.slices, &mut buf, &full, &shard.slices, elem_size);
        }
        Ok(Bytes::from(buf))
    }

    /// Re-partition onto `target` across all of its mesh's devices
    pub fn reshard(&self, target: ShardingSpec) -> Result<Tensor> {
        let devices: Vec<usize> = (0..target.mesh().device_count()).collect();
        self.reshard_on(target, &devices)
    }

    /// Gather, then scatter onto `target` keeping only the shards of `devices`
    pub fn reshard_on(&self, target: ShardingSpec, devices: &[usize]) -> Result<Tensor> {
        let value = self.gather()?;
        Tensor::from_global_on(self.dtype, self.shape.clone(), target, value, devices)
    }

    /// Element-wise equality of the full logical values, ignoring sharding
    pub fn same_values(&self, other: &Tensor) -> Result<bool> {
        if self.dtype != other.dtype || self.shape != other.shape {
            return Ok(false);
        }
        Ok(self.gather()? == other.gather()?)
    }
}

fn check_device(sharding: &ShardingSpec, device: usize) -> Result<()> {
    let count = sharding.mesh().device_count();
    if device >= count {
        return Err(Error::InvalidTensor {
            message: format!("device {} is outside a mesh of {} devices", device, count),
        });
    }
    Ok(())
}
