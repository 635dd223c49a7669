//! Storage backend trait definition
//!
//! Defines the async interface the checkpoint codec and manager use to touch
//! the step directory tree. Paths are relative to the backend's root.

use async_trait::async_trait;
use bytes::Bytes;
use ckpt_core::Result;

/// Async trait for storage backends
///
/// Implementors provide file CRUD plus the directory operations the commit
/// protocol relies on: a staging directory is published with a single
/// [`rename`](StorageBackend::rename).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read data from the given path
    ///
    /// # Errors
    /// Returns [`ckpt_core::Error::StoragePathNotFound`] if the path doesn't
    /// exist, [`ckpt_core::Error::Storage`] if the read fails
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to the given path
    ///
    /// Creates parent directories if they don't exist and writes through a
    /// temporary file, so readers never observe a partial file.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the file at the given path
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all file paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Names of the immediate subdirectories of `path`, sorted
    ///
    /// A missing directory lists as empty.
    async fn list_dirs(&self, path: &str) -> Result<Vec<String>>;

    /// Create a directory and its parents
    async fn create_dir_all(&self, path: &str) -> Result<()>;

    /// Atomically rename a file or directory
    ///
    /// Fails if `to` already exists as a non-empty directory.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Recursively remove a directory; removing a missing directory succeeds
    async fn remove_dir_all(&self, path: &str) -> Result<()>;
}
