//! Checkpoint manager coordinating sharded saves and restores
//!
//! One manager runs per participating process. A save writes into
//! `<step>.staging_<token>` and the leader publishes it as `<step>` with a
//! single rename once every process has written its shards, so a step
//! directory is either complete or absent.

use ckpt_core::{
    BarrierId, CheckpointConfig, Collective, CustomMetadata, Error, InProcessGroup, Result, Step,
};
use param_tree::{ParamPath, ParameterTree, PathFilter};
use serde::{Deserialize, Serialize};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::Codec;
use crate::record::CheckpointRecord;
use crate::reshard::restore_tree;

const STAGING_MARKER: &str = ".staging_";
const DELETING_MARKER: &str = ".deleting_";

fn step_dir(step: Step) -> String {
    step.to_string()
}

fn staging_dir(step: Step, token: &str) -> String {
    format!("{}{}{}", step, STAGING_MARKER, token)
}

fn deleting_dir(step: Step, token: &str) -> String {
    format!("{}{}{}", step, DELETING_MARKER, token)
}

fn save_barrier(seq: u64, step: Step, phase: &str) -> BarrierId {
    format!("save/{}/{}/{}", seq, step, phase)
}

/// Leader's proposal at the begin barrier of a save
///
/// Artifact names follow the position of a path in the saved tree, so every
/// process must save exactly the leader's paths.
#[derive(Debug, Serialize, Deserialize)]
struct BeginPayload {
    token: String,
    paths: Vec<ParamPath>,
}

impl BeginPayload {
    fn propose(tree: &ParameterTree) -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
            paths: tree.paths().cloned().collect(),
        }
    }

    fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn from_json(payload: Option<&str>) -> Result<Self> {
        let payload = payload.ok_or_else(|| Error::Internal {
            message: "leader proposed no staging token".to_string(),
        })?;
        Ok(serde_json::from_str(payload)?)
    }

    /// Fail with [`Error::PathMismatch`] unless `tree` holds the leader's paths
    fn check_paths(&self, tree: &ParameterTree) -> Result<()> {
        let mut local = tree.paths();
        for expected in &self.paths {
            match local.next() {
                Some(path) if path == expected => {}
                _ => {
                    return Err(Error::PathMismatch {
                        path: expected.to_string(),
                    })
                }
            }
        }
        match local.next() {
            Some(extra) => Err(Error::PathMismatch { path: extra.to_string() }),
            None => Ok(()),
        }
    }
}

/// Step of a committed directory name; staging and deleting names are not steps
fn parse_step(name: &str) -> Option<Step> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Options of a single save
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Paths taking part in the save
    pub filter: PathFilter,

    /// Metadata stored with the checkpoint
    pub custom_metadata: CustomMetadata,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save only the low-rank adapter parameters
    pub fn lora_only() -> Self {
        Self::new().filter(PathFilter::lora())
    }

    pub fn filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn custom_metadata(mut self, metadata: CustomMetadata) -> Self {
        self.custom_metadata = metadata;
        self
    }

    /// Add one metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.custom_metadata.insert(key.into(), value.into());
        self
    }
}

/// Options of a single restore
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Paths taking part in the restore
    pub filter: PathFilter,

    /// Step to restore instead of the latest one
    pub step: Option<Step>,
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore only the low-rank adapter parameters
    pub fn lora_only() -> Self {
        Self::new().filter(PathFilter::lora())
    }

    pub fn filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }
}

/// Builder for [`CheckpointManager`]
pub struct CheckpointManagerBuilder {
    config: CheckpointConfig,
    collective: Option<Arc<dyn Collective>>,
    storage: Option<Arc<dyn StorageBackend>>,
}

impl CheckpointManagerBuilder {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            collective: None,
            storage: None,
        }
    }

    /// Process group this manager saves with (default: a group of one)
    pub fn collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = Some(collective);
        self
    }

    /// Storage backend rooted at the checkpoint root (default: local filesystem)
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub async fn build(self) -> Result<CheckpointManager> {
        self.config.validate()?;

        let Some(root) = self.config.root_directory.clone() else {
            info!("No checkpoint root configured, checkpointing disabled");
            return Ok(CheckpointManager::with_backend(self.config, None));
        };

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(LocalStorage::new(&root)));
        let collective = self
            .collective
            .unwrap_or_else(|| Arc::new(InProcessGroup::single()));

        storage.create_dir_all("").await?;

        let backend = Backend {
            codec: Codec::new(storage),
            collective,
        };
        if self.config.cleanup_stale_on_open && backend.collective.is_leader() {
            backend.remove_stale().await?;
        }

        info!(
            root = %root.display(),
            process_index = backend.collective.process_index(),
            process_count = backend.collective.process_count(),
            generation = %self.config.format_generation,
            "Checkpoint manager opened"
        );
        Ok(CheckpointManager::with_backend(self.config, Some(Arc::new(backend))))
    }
}

/// Storage and process group held while the manager is open
struct Backend {
    codec: Codec,
    collective: Arc<dyn Collective>,
}

impl Backend {
    fn storage(&self) -> &Arc<dyn StorageBackend> {
        self.codec.storage()
    }

    async fn committed_steps(&self) -> Result<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .storage()
            .list_dirs("")
            .await?
            .iter()
            .filter_map(|name| parse_step(name))
            .collect();
        steps.sort_unstable();
        Ok(steps)
    }

    async fn is_committed(&self, step: Step) -> Result<bool> {
        Ok(self.committed_steps().await?.contains(&step))
    }

    /// Remove staging and deleting directories left by interrupted processes
    async fn remove_stale(&self) -> Result<()> {
        for name in self.storage().list_dirs("").await? {
            if name.contains(STAGING_MARKER) || name.contains(DELETING_MARKER) {
                warn!(directory = %name, "Removing stale checkpoint directory");
                self.storage().remove_dir_all(&name).await?;
            }
        }
        Ok(())
    }

    async fn discard(&self, staging: &str) {
        if let Err(e) = self.storage().remove_dir_all(staging).await {
            warn!(directory = %staging, error = %e, "Failed to discard staging directory");
        }
    }

    /// Keep the newest `keep` committed steps
    async fn prune(&self, keep: usize) -> Result<()> {
        let steps = self.committed_steps().await?;
        let excess = steps.len().saturating_sub(keep);
        for &step in &steps[..excess] {
            // Hide the step before deleting it
            let deleting = deleting_dir(step, &Uuid::new_v4().simple().to_string());
            self.storage().rename(&step_dir(step), &deleting).await?;
            self.storage().remove_dir_all(&deleting).await?;
            debug!(step, "Pruned checkpoint");
        }
        Ok(())
    }
}

/// Removes a step from the in-flight set when the save ends
struct InFlight<'a> {
    steps: &'a Mutex<HashSet<Step>>,
    step: Step,
}

impl<'a> InFlight<'a> {
    fn acquire(steps: &'a Mutex<HashSet<Step>>, step: Step) -> Result<Self> {
        if !steps.lock().insert(step) {
            return Err(Error::SaveInProgress { step });
        }
        Ok(Self { steps, step })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.steps.lock().remove(&self.step);
    }
}

/// Sharded checkpoint manager for one process of a group
pub struct CheckpointManager {
    config: CheckpointConfig,

    /// `None` when disabled or closed
    backend: RwLock<Option<Arc<Backend>>>,

    closed: AtomicBool,

    /// Steps with a save in flight
    in_flight: Mutex<HashSet<Step>>,

    /// Save attempts so far, keeps barrier ids unique
    save_seq: AtomicU64,
}

impl CheckpointManager {
    /// Open a single-process manager
    pub async fn new(config: CheckpointConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn builder(config: CheckpointConfig) -> CheckpointManagerBuilder {
        CheckpointManagerBuilder::new(config)
    }

    fn with_backend(config: CheckpointConfig, backend: Option<Arc<Backend>>) -> Self {
        Self {
            config,
            backend: RwLock::new(backend),
            closed: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            save_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Whether saves and restores touch storage
    pub fn is_enabled(&self) -> bool {
        !self.config.is_disabled()
    }

    fn backend(&self) -> Result<Option<Arc<Backend>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ManagerClosed);
        }
        Ok(self.backend.read().clone())
    }

    /// Save the full tree at `step`
    pub async fn save(&self, step: Step, tree: &ParameterTree) -> Result<bool> {
        self.save_with(step, tree, SaveOptions::default()).await
    }

    /// Save the paths of `tree` accepted by the filter at `step`
    ///
    /// Returns `false` without touching storage when the manager is disabled
    /// or nothing is left to save. Every process of the group must call this
    /// for the same steps in the same order.
    #[instrument(skip(self, tree, options))]
    pub async fn save_with(&self, step: Step, tree: &ParameterTree, options: SaveOptions) -> Result<bool> {
        let Some(backend) = self.backend()? else {
            debug!("Checkpointing disabled, skipping save");
            return Ok(false);
        };

        // Taken before anything can fail so every process agrees on barrier ids
        let seq = self.save_seq.fetch_add(1, Ordering::SeqCst);

        let tree = tree.filter_paths(&options.filter);
        if tree.is_empty() {
            debug!("Nothing to save");
            return Ok(false);
        }

        let checked = async {
            let in_flight = InFlight::acquire(&self.in_flight, step)?;
            if backend.is_committed(step).await? {
                return Err(Error::StepAlreadyExists { step });
            }
            Ok(in_flight)
        }
        .await;
        let _in_flight = match checked {
            Ok(in_flight) => in_flight,
            Err(e) => {
                backend.collective.abort(&save_barrier(seq, step, "begin"), &e.to_string());
                return Err(e);
            }
        };

        let record = CheckpointRecord::for_tree(step, &tree, self.config.format_generation, options.custom_metadata);
        self.run_save(&backend, seq, &record, &tree).await?;

        if let Some(keep) = self.config.max_to_keep {
            if backend.collective.is_leader() {
                if let Err(e) = backend.prune(keep).await {
                    warn!(error = %e, "Failed to prune old checkpoints");
                }
            }
        }
        Ok(true)
    }

    async fn run_save(&self, backend: &Backend, seq: u64, record: &CheckpointRecord, tree: &ParameterTree) -> Result<()> {
        let start = Instant::now();
        let step = record.step;
        let collective = &backend.collective;
        let is_leader = collective.is_leader();
        let timeout = self.config.barrier_timeout;
        let barrier = |phase: &str| save_barrier(seq, step, phase);

        let proposal = if is_leader {
            Some(BeginPayload::propose(tree).to_json()?)
        } else {
            None
        };
        let begin = collective
            .barrier(&barrier("begin"), proposal, timeout)
            .await
            .map_err(|e| e.into_partial_write(step))?;
        let begin = BeginPayload::from_json(begin.as_deref())?;
        let staging = staging_dir(step, &begin.token);

        let written = barrier("written");
        let local = async {
            begin.check_paths(tree)?;
            backend.storage().create_dir_all(&staging).await?;
            backend.codec.write(&staging, tree, record, is_leader).await
        }
        .await;
        let bytes = match local {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    step,
                    process_index = collective.process_index(),
                    error = %e,
                    "Failed to write checkpoint shards"
                );
                collective.abort(&written, &e.to_string());
                if is_leader {
                    backend.discard(&staging).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = collective.barrier(&written, None, timeout).await {
            if is_leader {
                backend.discard(&staging).await;
            }
            return Err(e.into_partial_write(step));
        }

        let committed = barrier("committed");
        if is_leader {
            let commit = async {
                backend.codec.read(&staging).await?.verify().await?;
                backend.storage().rename(&staging, &step_dir(step)).await
            }
            .await;
            if let Err(e) = commit {
                error!(step, error = %e, "Failed to commit checkpoint");
                collective.abort(&committed, &e.to_string());
                backend.discard(&staging).await;
                return Err(e);
            }
        }

        match collective.barrier(&committed, None, timeout).await {
            Ok(_) => {}
            // The rename already published the step
            Err(e) if is_leader => warn!(step, error = %e, "Commit barrier failed after publishing"),
            Err(e) => return Err(e.into_partial_write(step)),
        }

        info!(
            step,
            bytes,
            tensors = tree.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Checkpoint committed"
        );
        Ok(())
    }

    /// Restore the latest checkpoint into `tree`
    pub async fn maybe_restore(&self, tree: &mut ParameterTree) -> Result<(Step, CustomMetadata)> {
        self.maybe_restore_with(tree, RestoreOptions::default()).await
    }

    /// Restore into `tree`, returning `(0, {})` when there is nothing to restore
    pub async fn maybe_restore_with(&self, tree: &mut ParameterTree, options: RestoreOptions) -> Result<(Step, CustomMetadata)> {
        Ok(self
            .try_restore(tree, options)
            .await?
            .unwrap_or_else(|| (0, CustomMetadata::new())))
    }

    /// Restore into `tree`, returning `None` when no checkpoint is committed
    ///
    /// Only paths accepted by the filter and present both in the checkpoint
    /// and in `tree` change. On error `tree` is left untouched.
    #[instrument(skip_all, fields(step = ?options.step))]
    pub async fn try_restore(&self, tree: &mut ParameterTree, options: RestoreOptions) -> Result<Option<(Step, CustomMetadata)>> {
        let Some(backend) = self.backend()? else {
            return Ok(None);
        };

        let step = match options.step {
            Some(step) => {
                if !backend.is_committed(step).await? {
                    return Err(Error::CheckpointNotFound { step });
                }
                step
            }
            None => match backend.committed_steps().await?.last() {
                Some(&step) => step,
                None => {
                    info!("No committed checkpoint, starting fresh");
                    return Ok(None);
                }
            },
        };

        let reader = backend.codec.read(&step_dir(step)).await?;
        if reader.record().step != step {
            warn!(
                step,
                recorded_step = reader.record().step,
                "Checkpoint directory and record disagree on the step"
            );
        }

        let restored = restore_tree(&reader, tree, &options.filter).await?;
        let count = restored.len();
        tree.merge_from(restored)?;

        info!(
            step,
            restored = count,
            generation = %reader.generation(),
            "Checkpoint restored"
        );
        Ok(Some((step, reader.record().custom_metadata.clone())))
    }

    /// Newest committed step
    pub async fn latest_step(&self) -> Result<Option<Step>> {
        Ok(self.all_steps().await?.last().copied())
    }

    /// Every committed step in ascending order
    pub async fn all_steps(&self) -> Result<Vec<Step>> {
        match self.backend()? {
            Some(backend) => backend.committed_steps().await,
            None => Ok(Vec::new()),
        }
    }

    /// Record of a committed step
    pub async fn record(&self, step: Step) -> Result<CheckpointRecord> {
        let backend = match self.backend()? {
            Some(backend) if backend.is_committed(step).await? => backend,
            _ => return Err(Error::CheckpointNotFound { step }),
        };
        Ok(backend.codec.read(&step_dir(step)).await?.record().clone())
    }

    /// Release storage and the process group; later calls fail with [`Error::ManagerClosed`]
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.backend.write().take().is_some() {
            info!("Checkpoint manager closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Thread-safe handle to checkpoint manager
pub type CheckpointManagerHandle = Arc<CheckpointManager>;
