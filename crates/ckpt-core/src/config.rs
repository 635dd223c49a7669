//! Checkpoint manager configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, FormatGeneration, Result};

/// Configuration for a checkpoint manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Root directory holding one subdirectory per step; `None` disables the manager
    pub root_directory: Option<PathBuf>,

    /// Format generation written by `save`
    pub format_generation: FormatGeneration,

    /// Number of committed checkpoints to keep (`None` keeps all)
    pub max_to_keep: Option<usize>,

    /// Bounded wait for every collective barrier
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,

    /// Remove leftover staging and deletion directories when the manager opens
    pub cleanup_stale_on_open: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root_directory: None,
            format_generation: FormatGeneration::CURRENT,
            max_to_keep: None,
            barrier_timeout: Duration::from_secs(300),
            cleanup_stale_on_open: true,
        }
    }
}

impl CheckpointConfig {
    /// Configuration rooted at the given directory
    pub fn new(root_directory: impl Into<PathBuf>) -> Self {
        Self {
            root_directory: Some(root_directory.into()),
            ..Default::default()
        }
    }

    /// Configuration of a manager that never touches the filesystem
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the format generation written by `save`
    pub fn format_generation(mut self, generation: FormatGeneration) -> Self {
        self.format_generation = generation;
        self
    }

    /// Set the retention count
    pub fn max_to_keep(mut self, keep: usize) -> Self {
        self.max_to_keep = Some(keep);
        self
    }

    /// Set the barrier timeout
    pub fn barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    /// Whether saving and restoring are disabled
    pub fn is_disabled(&self) -> bool {
        self.root_directory.is_none()
    }

    /// Reject settings the manager cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_to_keep == Some(0) {
            return Err(Error::InvalidConfig {
                message: "max_to_keep must be at least 1".to_string(),
            });
        }
        if self.barrier_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "barrier_timeout must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
