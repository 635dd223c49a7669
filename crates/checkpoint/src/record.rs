//! Checkpoint records

use chrono::{DateTime, Utc};
use ckpt_core::{CustomMetadata, FormatGeneration, Step};
use param_tree::{ParamPath, ParameterTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a committed checkpoint holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Training step
    pub step: Step,

    /// Paths stored in the checkpoint
    pub paths_written: BTreeSet<ParamPath>,

    /// On-disk layout the checkpoint was written with
    pub format_generation: FormatGeneration,

    /// Caller-supplied metadata, returned verbatim on restore
    pub custom_metadata: CustomMetadata,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Record describing a save of `tree` at `step`
    pub fn for_tree(
        step: Step,
        tree: &ParameterTree,
        format_generation: FormatGeneration,
        custom_metadata: CustomMetadata,
    ) -> Self {
        Self {
            step,
            paths_written: tree.paths().cloned().collect(),
            format_generation,
            custom_metadata,
            created_at: Utc::now(),
        }
    }
}
