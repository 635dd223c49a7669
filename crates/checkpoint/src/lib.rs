//! Sharded checkpointing for distributed training
//!
//! Provides the on-disk codec (current sharded layout and the legacy
//! single-blob layout), the resharding engine and the checkpoint manager
//! that commits a save atomically across a process group.

pub mod codec;
pub mod index;
pub mod legacy;
pub mod manager;
pub mod record;
pub mod reshard;

pub use codec::{CheckpointReader, Codec};
pub use index::{CheckpointIndex, ShardDescriptor, TensorDescriptor};
pub use manager::{
    CheckpointManager, CheckpointManagerBuilder, CheckpointManagerHandle, RestoreOptions, SaveOptions,
};
pub use record::CheckpointRecord;
pub use reshard::{restore_tensor, restore_tree};
