//! Serialization codec
//!
//! Writes a parameter tree into a step directory in the configured format
//! generation and reads any supported generation back through one
//! [`CheckpointReader`], so callers never see which layout was on disk.

use bytes::Bytes;
use ckpt_core::{Error, FormatGeneration, Result};
use param_tree::layout::full_slices;
use param_tree::{ParamPath, ParameterTree, ShardingSpec};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::StorageBackend;
use tracing::{debug, info, instrument, warn};

use crate::index::{declared_generation, shard_file, CheckpointIndex, ShardDescriptor, TensorDescriptor, INDEX_FILE};
use crate::legacy::{self, BLOB_FILE};
use crate::record::CheckpointRecord;

/// Join a relative storage path and a name
pub(crate) fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Reads and writes checkpoint directories on a storage backend
#[derive(Clone)]
pub struct Codec {
    storage: Arc<dyn StorageBackend>,
}

impl Codec {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Write this process's share of `tree` into `dir`
    ///
    /// For the sharded generation every process writes the shard slots whose
    /// replica 0 it holds and the leader adds the index. The single-blob
    /// generation is written by the leader alone. Returns the bytes written.
    #[instrument(skip(self, tree, record), fields(step = record.step, generation = %record.format_generation))]
    pub async fn write(&self, dir: &str, tree: &ParameterTree, record: &CheckpointRecord, is_leader: bool) -> Result<u64> {
        match record.format_generation {
            FormatGeneration::Sharded => self.write_sharded(dir, tree, record, is_leader).await,
            FormatGeneration::SingleBlob if is_leader => {
                let blob = legacy::encode(record, tree)?;
                self.storage.write(&join(dir, BLOB_FILE), blob).await
            }
            FormatGeneration::SingleBlob => Ok(0),
        }
    }

    async fn write_sharded(&self, dir: &str, tree: &ParameterTree, record: &CheckpointRecord, is_leader: bool) -> Result<u64> {
        let mut written = 0;
        let mut artifacts = 0;

        for (ordinal, (path, tensor)) in tree.iter().enumerate() {
            let sharding = tensor.sharding();
            for shard in tensor.shards() {
                if sharding.replica_id(shard.device()) != 0 {
                    continue;
                }
                let artifact = shard_file(ordinal, sharding.shard_ordinal(shard.device()));
                debug!(%path, artifact = %artifact, device = shard.device(), "Writing shard");
                written += self.storage.write(&join(dir, &artifact), shard.data().clone()).await?;
                artifacts += 1;
            }
        }

        if is_leader {
            let index = CheckpointIndex::build(record, tree).to_json()?;
            written += self.storage.write(&join(dir, INDEX_FILE), Bytes::from(index)).await?;
        }

        debug!(artifacts, bytes = written, "Local checkpoint share written");
        Ok(written)
    }

    /// Open the checkpoint in `dir`, detecting its format generation
    #[instrument(skip(self))]
    pub async fn read(&self, dir: &str) -> Result<CheckpointReader> {
        let index_path = join(dir, INDEX_FILE);

        let index_error = match self.storage.read(&index_path).await {
            Ok(bytes) => {
                if let Some(found) = declared_generation(&bytes) {
                    let supported = FormatGeneration::CURRENT.as_u32();
                    if found > u64::from(supported) {
                        return Err(Error::UnsupportedGeneration {
                            found: u32::try_from(found).unwrap_or(u32::MAX),
                            supported,
                        });
                    }
                }
                match CheckpointIndex::from_json(&index_path, &bytes) {
                    Ok(index) => return self.sharded_reader(dir, index, &index_path),
                    Err(e) => e,
                }
            }
            Err(Error::StoragePathNotFound { .. }) => Error::CorruptIndex {
                location: index_path.clone(),
                reason: "no index".to_string(),
            },
            Err(e) => return Err(e),
        };

        let blob_path = join(dir, BLOB_FILE);
        match self.storage.read(&blob_path).await {
            Ok(blob) => {
                debug!(location = %blob_path, "Falling back to single-blob format");
                Ok(CheckpointReader::from_blob(legacy::decode(&blob_path, blob)?))
            }
            Err(Error::StoragePathNotFound { .. }) => Err(index_error),
            Err(e) => Err(e),
        }
    }

    fn sharded_reader(&self, dir: &str, index: CheckpointIndex, location: &str) -> Result<CheckpointReader> {
        let (record, entries) = index.into_parts(location)?;
        info!(step = record.step, tensors = entries.len(), "Opened sharded checkpoint");
        Ok(CheckpointReader {
            record,
            entries,
            source: Source::Sharded {
                storage: Arc::clone(&self.storage),
                dir: dir.to_string(),
            },
        })
    }
}

enum Source {
    Sharded { storage: Arc<dyn StorageBackend>, dir: String },
    Blob { tensors: BTreeMap<ParamPath, Bytes> },
}

/// Generation-independent view of a stored checkpoint
pub struct CheckpointReader {
    record: CheckpointRecord,
    entries: BTreeMap<ParamPath, TensorDescriptor>,
    source: Source,
}

impl CheckpointReader {
    fn from_blob(checkpoint: legacy::LegacyCheckpoint) -> Self {
        let mut entries = BTreeMap::new();
        let mut tensors = BTreeMap::new();
        for (path, entry) in checkpoint.tensors {
            let descriptor = TensorDescriptor {
                dtype: entry.dtype,
                sharding: ShardingSpec::single_device(entry.shape.len()),
                shards: vec![ShardDescriptor {
                    slices: full_slices(&entry.shape),
                    file: BLOB_FILE.to_string(),
                    num_bytes: entry.data.len() as u64,
                }],
                shape: entry.shape,
            };
            entries.insert(path.clone(), descriptor);
            tensors.insert(path, entry.data);
        }

        info!(step = checkpoint.record.step, tensors = entries.len(), "Opened single-blob checkpoint");
        Self {
            record: checkpoint.record,
            entries,
            source: Source::Blob { tensors },
        }
    }

    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }

    pub fn generation(&self) -> FormatGeneration {
        self.record.format_generation
    }

    /// Stored tensors by path
    pub fn entries(&self) -> &BTreeMap<ParamPath, TensorDescriptor> {
        &self.entries
    }

    pub fn entry(&self, path: &ParamPath) -> Option<&TensorDescriptor> {
        self.entries.get(path)
    }

    /// Bytes of stored shard `shard` of `path`
    pub async fn read_shard(&self, path: &ParamPath, shard: usize) -> Result<Bytes> {
        let descriptor = self
            .entries
            .get(path)
            .and_then(|d| d.shards.get(shard))
            .ok_or_else(|| Error::Internal {
                message: format!("no stored shard {} for {}", shard, path),
            })?;

        match &self.source {
            Source::Blob { tensors } => tensors.get(path).cloned().ok_or_else(|| Error::Internal {
                message: format!("blob has no data for {}", path),
            }),
            Source::Sharded { storage, dir } => {
                let artifact = join(dir, &descriptor.file);
                let data = storage.read(&artifact).await.map_err(|e| match e {
                    Error::StoragePathNotFound { .. } => Error::MissingArtifact {
                        artifact: artifact.clone(),
                    },
                    other => other,
                })?;
                if data.len() as u64 != descriptor.num_bytes {
                    return Err(Error::CorruptArtifact {
                        artifact,
                        reason: format!("expected {} bytes, found {}", descriptor.num_bytes, data.len()),
                    });
                }
                Ok(data)
            }
        }
    }

    /// Fail with [`Error::MissingArtifact`] unless every referenced artifact exists
    pub async fn verify(&self) -> Result<()> {
        let Source::Sharded { storage, dir } = &self.source else {
            return Ok(());
        };
        for descriptor in self.entries.values() {
            for shard in &descriptor.shards {
                let artifact = join(dir, &shard.file);
                if !storage.exists(&artifact).await? {
                    warn!(artifact = %artifact, "Indexed artifact is missing");
                    return Err(Error::MissingArtifact { artifact });
                }
            }
        }
        Ok(())
    }
}
