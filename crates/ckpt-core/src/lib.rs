//! Checkpoint Core - Foundation for the sharded checkpoint runtime
//!
//! Provides the shared error taxonomy, configuration, core types and the
//! collective barrier used by cooperating checkpoint writers.

pub mod collective;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use collective::{Collective, GroupMember, InProcessGroup};
pub use config::CheckpointConfig;
pub use error::{Error, Result};
pub use types::*;
