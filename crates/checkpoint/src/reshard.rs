//! Resharding engine
//!
//! Stored shards and template shards are both rectangular slices of the
//! same global array. Each local template shard is filled by copying its
//! intersection with every stored shard, so no process ever materialises
//! more than the stored shards that overlap what it holds.

use bytes::Bytes;
use ckpt_core::{Error, Result};
use param_tree::layout::{copy_region, intersect, slice_volume};
use param_tree::{ParamPath, ParameterTree, PathFilter, Shard, Tensor};
use std::collections::HashMap;
use tracing::debug;

use crate::codec::CheckpointReader;
use crate::index::TensorDescriptor;

/// Rebuild the stored tensor at `path` with the sharding and devices of `template`
pub async fn restore_tensor(
    reader: &CheckpointReader,
    path: &ParamPath,
    descriptor: &TensorDescriptor,
    template: &Tensor,
) -> Result<Tensor> {
    if descriptor.dtype != template.dtype() {
        return Err(Error::DtypeMismatch {
            path: path.to_string(),
            stored: descriptor.dtype.to_string(),
            requested: template.dtype().to_string(),
        });
    }
    if descriptor.shape != template.shape() {
        return Err(Error::ShapeMismatch {
            path: path.to_string(),
            stored: descriptor.shape.clone(),
            requested: template.shape().to_vec(),
        });
    }

    let elem_size = descriptor.dtype.size_in_bytes();
    let mut stored: HashMap<usize, Bytes> = HashMap::new();
    let mut shards = Vec::with_capacity(template.shards().len());

    for local in template.shards() {
        let target = local.slices();
        let volume = slice_volume(target);
        let mut buf = vec![0u8; volume * elem_size];
        let mut copied = 0;

        for (index, source) in descriptor.shards.iter().enumerate() {
            let Some(region) = intersect(&source.slices, target) else {
                continue;
            };
            if !stored.contains_key(&index) {
                stored.insert(index, reader.read_shard(path, index).await?);
            }
            let data = &stored[&index];
            copy_region(data, &source.slices, &mut buf, target, &region, elem_size);
            copied += slice_volume(&region);
        }

        if copied != volume {
            return Err(Error::CorruptIndex {
                location: path.to_string(),
                reason: format!(
                    "stored shards cover {} of the {} elements of slice {:?}",
                    copied, volume, target
                ),
            });
        }
        shards.push(Shard::new(local.device(), target.to_vec(), Bytes::from(buf)));
    }

    debug!(%path, stored_shards_read = stored.len(), local_shards = shards.len(), "Tensor restored");
    Tensor::from_shards(
        template.dtype(),
        template.shape().to_vec(),
        template.sharding().clone(),
        shards,
    )
}

/// Restore every stored path accepted by `filter` that `template` also holds
///
/// Paths missing on either side are skipped. The result only holds restored
/// paths and is meant to be merged into the template.
pub async fn restore_tree(reader: &CheckpointReader, template: &ParameterTree, filter: &PathFilter) -> Result<ParameterTree> {
    let mut restored = ParameterTree::new();

    for (path, descriptor) in reader.entries() {
        if !filter.matches(path) {
            continue;
        }
        let Some(target) = template.get(path) else {
            debug!(%path, "Stored path absent from template, skipping");
            continue;
        };
        restored.insert(path.clone(), restore_tensor(reader, path, descriptor, target).await?);
    }

    for path in template.paths() {
        if filter.matches(path) && reader.entry(path).is_none() {
            debug!(%path, "Template path absent from checkpoint, keeping current value");
        }
    }

    Ok(restored)
}
