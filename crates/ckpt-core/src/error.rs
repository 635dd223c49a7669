//! Error types for the sharded checkpoint runtime

use thiserror::Error;

use crate::Step;

/// Result type alias using the checkpoint Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every crate of the checkpoint runtime
#[derive(Error, Debug)]
pub enum Error {
    // Sharding and tensor errors
    #[error("Invalid sharding: {message}")]
    InvalidSharding { message: String },

    #[error("Invalid tensor: {message}")]
    InvalidTensor { message: String },

    #[error("Tensor shards do not cover the full array: {message}")]
    ShardCoverage { message: String },

    // Parameter tree errors
    #[error("Path differs between parameter trees: {path}")]
    PathMismatch { path: String },

    // Codec errors
    #[error("Corrupt checkpoint index at {location}: {reason}")]
    CorruptIndex { location: String, reason: String },

    #[error("Missing shard artifact: {artifact}")]
    MissingArtifact { artifact: String },

    #[error("Corrupt shard artifact {artifact}: {reason}")]
    CorruptArtifact { artifact: String, reason: String },

    #[error("Unsupported format generation {found} (newest supported is {supported})")]
    UnsupportedGeneration { found: u32, supported: u32 },

    // Restore errors
    #[error("Dtype mismatch at {path}: stored {stored}, requested {requested}")]
    DtypeMismatch {
        path: String,
        stored: String,
        requested: String,
    },

    #[error("Shape mismatch at {path}: stored {stored:?}, requested {requested:?}")]
    ShapeMismatch {
        path: String,
        stored: Vec<usize>,
        requested: Vec<usize>,
    },

    #[error("Checkpoint not found for step {step}")]
    CheckpointNotFound { step: Step },

    // Save errors
    #[error("Partial write for step {step}: {message}")]
    PartialWrite { step: Step, message: String },

    #[error("Checkpoint for step {step} is already committed")]
    StepAlreadyExists { step: Step },

    #[error("A save for step {step} is already in flight")]
    SaveInProgress { step: Step },

    #[error("Checkpoint manager is closed")]
    ManagerClosed,

    // Coordination errors
    #[error("Barrier timeout: {barrier_id} (waited {timeout_ms}ms)")]
    BarrierTimeout { barrier_id: String, timeout_ms: u64 },

    #[error("Barrier aborted: {barrier_id} - {reason}")]
    BarrierAborted { barrier_id: String, reason: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. }
                | Error::BarrierTimeout { .. }
                | Error::PartialWrite { .. }
                | Error::SaveInProgress { .. }
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptIndex { .. }
                | Error::CorruptArtifact { .. }
                | Error::UnsupportedGeneration { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Map a coordination failure seen during a save into a partial write
    pub fn into_partial_write(self, step: Step) -> Self {
        match self {
            Error::BarrierTimeout { .. } | Error::BarrierAborted { .. } => Error::PartialWrite {
                step,
                message: self.to_string(),
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
