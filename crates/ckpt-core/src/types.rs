//! Core type definitions shared across the checkpoint crates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Training step identifying a checkpoint
pub type Step = u64;

/// Caller-supplied metadata stored alongside a checkpoint
pub type CustomMetadata = BTreeMap<String, serde_json::Value>;

/// Identifier of a collective barrier
pub type BarrierId = String;

/// Versioned on-disk layout of a checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormatGeneration {
    /// Generation 1: one blob holding every tensor unsharded
    SingleBlob,

    /// Generation 2: JSON index plus one artifact per shard
    Sharded,
}

impl FormatGeneration {
    /// Generation written by default and newest one understood
    pub const CURRENT: FormatGeneration = FormatGeneration::Sharded;

    /// Numeric tag recorded on disk
    pub fn as_u32(self) -> u32 {
        match self {
            FormatGeneration::SingleBlob => 1,
            FormatGeneration::Sharded => 2,
        }
    }

    /// Parse an on-disk numeric tag
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(FormatGeneration::SingleBlob),
            2 => Some(FormatGeneration::Sharded),
            _ => None,
        }
    }
}

impl Default for FormatGeneration {
    fn default() -> Self {
        FormatGeneration::CURRENT
    }
}

impl fmt::Display for FormatGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatGeneration::SingleBlob => write!(f, "single-blob (gen 1)"),
            FormatGeneration::Sharded => write!(f, "sharded (gen 2)"),
        }
    }
}
