//! Storage - Filesystem backends for sharded checkpoints
//!
//! Provides async storage operations for the local (or already-mounted)
//! filesystem, with atomic file writes and directory renames.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> ckpt_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("7.staging_ab12/index", Bytes::from_static(b"{}")).await?;
//! storage.rename("7.staging_ab12", "7").await?;
//! let index = storage.read("7/index").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
