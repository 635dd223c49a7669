//! Generation 1 single-blob checkpoints
//!
//! Layout of `<step>/checkpoint` (little-endian):
//!
//! ```text
//! magic "CKPT" | version u32 | step u64 | metadata_len u32 | metadata json | body_len u64 | body
//! ```
//!
//! The body is a bincode-encoded list of fully gathered tensors, each keyed
//! by the key list of its path.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use ckpt_core::{CustomMetadata, Error, FormatGeneration, Result, Step};
use param_tree::{DType, ParamPath, ParameterTree, PathKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::CheckpointRecord;

/// Name of the blob inside a step directory
pub const BLOB_FILE: &str = "checkpoint";

/// Magic bytes opening every blob
pub const BLOB_MAGIC: [u8; 4] = *b"CKPT";

/// Fixed header bytes preceding the metadata json
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 4;

#[derive(Debug, Serialize, Deserialize)]
struct BlobMetadata {
    created_at: DateTime<Utc>,
    #[serde(default)]
    custom_metadata: CustomMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobBody {
    tensors: Vec<BlobTensor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobTensor {
    path: Vec<BlobKey>,
    dtype: String,
    shape: Vec<u64>,
    data: Vec<u8>,
}

/// Path key with an explicit variant tag, as bincode cannot read untagged enums
#[derive(Debug, Serialize, Deserialize)]
enum BlobKey {
    Index(u64),
    Name(String),
}

impl From<&PathKey> for BlobKey {
    fn from(key: &PathKey) -> Self {
        match key {
            PathKey::Index(i) => BlobKey::Index(*i as u64),
            PathKey::Name(n) => BlobKey::Name(n.clone()),
        }
    }
}

impl From<BlobKey> for PathKey {
    fn from(key: BlobKey) -> Self {
        match key {
            BlobKey::Index(i) => PathKey::Index(i as usize),
            BlobKey::Name(n) => PathKey::Name(n),
        }
    }
}

/// Fully gathered tensor read from a blob
#[derive(Debug, Clone, PartialEq)]
pub struct BlobEntry {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Bytes,
}

/// Decoded single-blob checkpoint
#[derive(Debug, Clone)]
pub struct LegacyCheckpoint {
    pub record: CheckpointRecord,
    pub tensors: BTreeMap<ParamPath, BlobEntry>,
}

/// Encode `tree` as a single blob
///
/// Every tensor is gathered, so each must be fully addressable here.
pub fn encode(record: &CheckpointRecord, tree: &ParameterTree) -> Result<Bytes> {
    let tensors = tree
        .iter()
        .map(|(path, tensor)| {
            Ok(BlobTensor {
                path: path.keys().iter().map(BlobKey::from).collect(),
                dtype: tensor.dtype().to_string(),
                shape: tensor.shape().iter().map(|&d| d as u64).collect(),
                data: tensor.gather()?.to_vec(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let body = bincode::serialize(&BlobBody { tensors }).map_err(|e| Error::Serialization(e.to_string()))?;
    let metadata = serde_json::to_vec(&BlobMetadata {
        created_at: record.created_at,
        custom_metadata: record.custom_metadata.clone(),
    })?;

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata.len() + 8 + body.len());
    buf.put_slice(&BLOB_MAGIC);
    buf.put_u32_le(FormatGeneration::SingleBlob.as_u32());
    buf.put_u64_le(record.step);
    buf.put_u32_le(metadata.len() as u32);
    buf.put_slice(&metadata);
    buf.put_u64_le(body.len() as u64);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode a blob read from `location`
pub fn decode(location: &str, mut buf: Bytes) -> Result<LegacyCheckpoint> {
    let corrupt = |reason: String| Error::CorruptIndex {
        location: location.to_string(),
        reason,
    };

    if buf.remaining() < FIXED_HEADER_LEN {
        return Err(corrupt(format!("blob of {} bytes is shorter than its header", buf.remaining())));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != BLOB_MAGIC {
        return Err(corrupt(format!("bad magic {:?}", magic)));
    }

    let version = buf.get_u32_le();
    match FormatGeneration::from_u32(version) {
        Some(FormatGeneration::SingleBlob) => {}
        Some(_) => return Err(corrupt(format!("blob declares version {}", version))),
        None if version > FormatGeneration::CURRENT.as_u32() => {
            return Err(Error::UnsupportedGeneration {
                found: version,
                supported: FormatGeneration::CURRENT.as_u32(),
            })
        }
        None => return Err(corrupt(format!("blob declares version {}", version))),
    }

    let step: Step = buf.get_u64_le();
    let metadata_len = buf.get_u32_le() as usize;
    if buf.remaining() < metadata_len + 8 {
        return Err(corrupt("truncated metadata".to_string()));
    }
    let metadata: BlobMetadata = serde_json::from_slice(&buf.split_to(metadata_len))
        .map_err(|e| corrupt(format!("metadata: {}", e)))?;

    let body_len = buf.get_u64_le() as usize;
    if buf.remaining() != body_len {
        return Err(corrupt(format!(
            "body declares {} bytes, {} present",
            body_len,
            buf.remaining()
        )));
    }
    let body: BlobBody = bincode::deserialize(&buf).map_err(|e| corrupt(format!("body: {}", e)))?;

    let mut tensors = BTreeMap::new();
    for tensor in body.tensors {
        let path = ParamPath::new(tensor.path.into_iter().map(PathKey::from).collect());
        let entry = BlobEntry {
            dtype: tensor.dtype.parse().map_err(|e: Error| corrupt(e.to_string()))?,
            shape: tensor.shape.iter().map(|&d| d as usize).collect(),
            data: Bytes::from(tensor.data),
        };
        let expected = entry.shape.iter().product::<usize>() * entry.dtype.size_in_bytes();
        if entry.data.len() != expected {
            return Err(corrupt(format!(
                "{} holds {} bytes, its shape needs {}",
                path,
                entry.data.len(),
                expected
            )));
        }
        if tensors.insert(path.clone(), entry).is_some() {
            return Err(corrupt(format!("{} is stored twice", path)));
        }
    }

    let record = CheckpointRecord {
        step,
        paths_written: tensors.keys().cloned().collect(),
        format_generation: FormatGeneration::SingleBlob,
        custom_metadata: metadata.custom_metadata,
        created_at: metadata.created_at,
    };
    Ok(LegacyCheckpoint { record, tensors })
}
