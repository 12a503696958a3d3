//! Per-node snapshot task
//!
//! A task is one node's unit of snapshot work. It registers with the
//! checkpoint subsystem, and the checkpoint thread drives `start()` at
//! the boundary: delta writers are installed, authoritative partition
//! lengths recorded, and the sender initialized. The body then runs on
//! the snapshot pool once the checkpoint has flushed: cache configs,
//! type metadata, mapping metadata, then per partition a clean copy
//! followed by its delta.
//!
//! State machine:
//!
//! ```text
//! INIT → SCHEDULED → STARTED → COPYING → SENDING_DELTA
//!                                   → DONE | FAILED | CANCELLED
//! ```
//!
//! Aborts are cooperative: `accept_exception` poisons the sender, the
//! next sub-call fast-fails, and the body finalizes through
//! `close(Some(_))`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheEngine, CheckpointContext, CheckpointHandle, CheckpointListener};
use crate::cluster::NodeId;
use crate::delta::DeltaWriter;
use crate::errors::{SnapshotError, SnapshotResult};
use crate::layout::{delta_file_name, DB_DIR};
use crate::page::PartitionId;
use crate::sender::{Poison, SnapshotSender};

/// Task lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Init,
    Scheduled,
    Started,
    Copying,
    SendingDelta,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    /// True for `Done`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }
}

/// Selected partitions per group; `None` selects all local partitions
/// plus the group index.
pub type PartSelection = BTreeMap<i32, Option<BTreeSet<i32>>>;

struct PartPlan {
    partition: PartitionId,
    cache_dir: String,
    file: PathBuf,
    len: u64,
    delta: Arc<DeltaWriter>,
    delta_path: PathBuf,
}

struct StartupData {
    groups: Vec<(i32, String)>,
    plans: Vec<Arc<PartPlan>>,
    checkpoint: CheckpointHandle,
}

/// One node's snapshot work for one snapshot name.
pub struct SnapshotTask {
    name: String,
    request_id: Uuid,
    origin: NodeId,
    parts: PartSelection,
    cache: Arc<dyn CacheEngine>,
    sender: Arc<dyn SnapshotSender>,
    poison: Arc<Poison>,
    tmp_dir: PathBuf,
    state_tx: watch::Sender<TaskState>,
    startup: Mutex<Option<StartupData>>,
}

struct TaskCheckpointListener(Arc<SnapshotTask>);

impl CheckpointListener for TaskCheckpointListener {
    fn on_checkpoint_begin(&self, cx: &CheckpointContext) {
        if let Err(err) = self.0.start(cx) {
            warn!(name = %self.0.name, %err, "snapshot task failed to start");
            self.0.accept_exception(err);
        }
    }
}

impl SnapshotTask {
    /// Create a task in the `INIT` state.
    ///
    /// `tmp_dir` is this snapshot's slice of the temp work directory;
    /// delta files are laid out under it mirroring the database layout.
    pub fn new(
        name: &str,
        request_id: Uuid,
        origin: NodeId,
        parts: PartSelection,
        cache: Arc<dyn CacheEngine>,
        sender: Arc<dyn SnapshotSender>,
        poison: Arc<Poison>,
        tmp_dir: PathBuf,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(TaskState::Init);
        Arc::new(Self {
            name: name.to_string(),
            request_id,
            origin,
            parts,
            cache,
            sender,
            poison,
            tmp_dir,
            state_tx,
            startup: Mutex::new(None),
        })
    }

    /// Snapshot name this task emits.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Two-phase process run this task belongs to.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Node that requested the snapshot.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// Groups this task covers.
    pub fn group_ids(&self) -> Vec<i32> {
        self.parts.keys().copied().collect()
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        *self.state_tx.borrow()
    }

    fn transition(&self, state: TaskState) {
        let _ = self.state_tx.send(state);
    }

    /// Register with the checkpoint subsystem; the next checkpoint
    /// boundary drives [`start`](Self::start).
    pub fn schedule(self: &Arc<Self>) {
        self.cache.schedule_checkpoint_listener(Arc::new(TaskCheckpointListener(Arc::clone(self))));
        self.transition(TaskState::Scheduled);
        debug!(name = %self.name, "snapshot task scheduled");
    }

    /// Checkpoint-boundary entry point, driven by the checkpoint thread.
    fn start(&self, cx: &CheckpointContext) -> SnapshotResult<()> {
        self.poison.check()?;

        // Everything the boundary cut covers must be durable in the log
        // before partition files are captured.
        self.cache.flush_wal()?;

        let page_size = self.cache.page_size();
        let node_db = self.tmp_dir.join(DB_DIR).join(self.cache.node_folder());

        let mut groups = Vec::new();
        let mut plans: Vec<Arc<PartPlan>> = Vec::new();

        let planned = (|| -> SnapshotResult<()> {
            for (group_id, selection) in &self.parts {
                let group = self
                    .cache
                    .group(*group_id)
                    .ok_or(SnapshotError::CacheGroupStopped(*group_id))?;
                let cache_dir = group.name.clone();

                let selected: Vec<i32> = match selection {
                    Some(parts) => parts.iter().copied().collect(),
                    None => {
                        let mut all = self.cache.partitions(*group_id)?;
                        all.push(crate::page::INDEX_PARTITION);
                        all
                    }
                };

                for part in selected {
                    let partition = PartitionId::new(*group_id, part);
                    let pages = cx.pages(partition);
                    let file = self.cache.partition_file(partition)?;
                    let delta_path = node_db.join(&cache_dir).join(delta_file_name(partition));

                    let delta =
                        Arc::new(DeltaWriter::open(partition, &delta_path, page_size, pages)?);
                    cx.install_interceptor(partition, Arc::clone(&delta));

                    plans.push(Arc::new(PartPlan {
                        partition,
                        cache_dir: cache_dir.clone(),
                        file,
                        len: pages as u64 * page_size as u64,
                        delta,
                        delta_path,
                    }));
                }

                groups.push((*group_id, cache_dir));
            }
            Ok(())
        })();

        let total_parts = plans.len() as u32;

        // Startup data is stored before the fallible init so finalize can
        // always release the capture windows installed above.
        *self.startup.lock().expect("startup lock poisoned") =
            Some(StartupData { groups, plans, checkpoint: cx.handle() });

        planned?;
        self.sender.init(total_parts)?;

        self.transition(TaskState::Started);
        info!(name = %self.name, parts = total_parts, "snapshot task started");
        Ok(())
    }

    /// Asynchronously abort the task; idempotent. The poisoned sender
    /// makes every subsequent sub-call fast-fail.
    pub fn accept_exception(&self, err: SnapshotError) {
        let effective = self.poison.poison(err);
        // Kick the state watch so a body parked before the boundary
        // observes the poison promptly.
        self.state_tx.send_modify(|_| {});
        debug!(name = %self.name, %effective, "snapshot task poisoned");
    }

    /// Equivalent to `accept_exception(Cancelled)`.
    pub fn cancel(&self) {
        self.accept_exception(SnapshotError::Cancelled);
    }

    /// Wait until `start()` returned or the task failed.
    pub async fn await_started(&self) -> SnapshotResult<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return Err(self.poison.get().unwrap_or(SnapshotError::Cancelled));
            }
            if state >= TaskState::Started {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(SnapshotError::Cancelled);
            }
        }
    }

    /// Wait for the terminal state; `Ok` only for `DONE`.
    pub async fn wait_done(&self) -> SnapshotResult<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return match state {
                    TaskState::Done => Ok(()),
                    _ => Err(self.poison.get().unwrap_or(SnapshotError::Cancelled)),
                };
            }
            if rx.changed().await.is_err() {
                return Err(SnapshotError::Cancelled);
            }
        }
    }

    /// Task body; runs on the snapshot pool after scheduling.
    ///
    /// Waits for the boundary, waits for the checkpoint to flush its
    /// portion of every selected partition, then drives the sender
    /// through the ordered lifecycle.
    pub async fn run(self: Arc<Self>, pool: Arc<Semaphore>) {
        let aborted = self.wait_for_start().await.is_err();

        if !aborted {
            self.emit(&pool).await;
        }

        self.finalize();
    }

    async fn wait_for_start(&self) -> SnapshotResult<()> {
        // An abort before the boundary kicks the state watch, so a parked
        // body re-checks the poison here.
        let mut rx = self.state_tx.subscribe();
        loop {
            if let Some(err) = self.poison.get() {
                return Err(err);
            }
            let state = *rx.borrow();
            if state.is_terminal() {
                return Err(self.poison.get().unwrap_or(SnapshotError::Cancelled));
            }
            if state >= TaskState::Started {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(SnapshotError::Cancelled);
            }
        }
    }

    async fn emit(self: &Arc<Self>, pool: &Arc<Semaphore>) {
        let Some(startup) = self.startup.lock().expect("startup lock poisoned").take() else {
            self.accept_exception(SnapshotError::StorageFailed(
                "task started without startup data".to_string(),
            ));
            return;
        };

        // A partition file is copied only after the checkpoint that
        // opened its delta writer has flushed it.
        startup.checkpoint.clone().wait().await;

        if let Err(err) = self.metadata_stage(&startup) {
            self.accept_exception(err);
            self.release_windows(&startup.plans);
            return;
        }

        self.transition(TaskState::Copying);
        self.copy_stage(&startup, pool).await;

        self.transition(TaskState::SendingDelta);
        self.delta_stage(&startup, pool).await;
    }

    fn metadata_stage(&self, startup: &StartupData) -> SnapshotResult<()> {
        for (group_id, cache_dir) in &startup.groups {
            for cfg in self.cache.cache_config_files(*group_id)? {
                self.sender.send_cache_config(&cfg, cache_dir)?;
            }
        }
        self.sender.send_type_metadata(&self.cache.type_metadata()?)?;
        self.sender.send_mapping_metadata(&self.cache.mapping_metadata()?)?;
        Ok(())
    }

    async fn copy_stage(self: &Arc<Self>, startup: &StartupData, pool: &Arc<Semaphore>) {
        if self.sender.sequential() {
            for plan in &startup.plans {
                self.copy_one(plan, pool).await;
            }
        } else {
            let jobs = startup
                .plans
                .iter()
                .map(|plan| {
                    let task = Arc::clone(self);
                    let plan = Arc::clone(plan);
                    let pool = Arc::clone(pool);
                    async move { task.copy_one(&plan, &pool).await }
                })
                .collect::<Vec<_>>();
            join_all(jobs).await;
        }
    }

    /// Copy one clean partition and close its capture window.
    async fn copy_one(self: &Arc<Self>, plan: &Arc<PartPlan>, pool: &Arc<Semaphore>) {
        let Ok(_permit) = Arc::clone(pool).acquire_owned().await else {
            return;
        };

        let sender = Arc::clone(&self.sender);
        let plan_job = Arc::clone(plan);
        let copied = tokio::task::spawn_blocking(move || {
            sender.send_part(&plan_job.file, &plan_job.cache_dir, plan_job.partition, plan_job.len)
        })
        .await
        .unwrap_or_else(|join| Err(SnapshotError::StorageFailed(join.to_string())));

        // The window closes when the copy is complete, success or not.
        self.cache.remove_page_interceptor(plan.partition, &plan.delta);
        let close = plan.delta.close();

        if let Err(err) = copied.and(close) {
            self.accept_exception(err);
        }
    }

    async fn delta_stage(self: &Arc<Self>, startup: &StartupData, pool: &Arc<Semaphore>) {
        if self.sender.sequential() {
            for plan in &startup.plans {
                self.delta_one(plan, pool).await;
            }
        } else {
            let jobs = startup
                .plans
                .iter()
                .map(|plan| {
                    let task = Arc::clone(self);
                    let plan = Arc::clone(plan);
                    let pool = Arc::clone(pool);
                    async move { task.delta_one(&plan, &pool).await }
                })
                .collect::<Vec<_>>();
            join_all(jobs).await;
        }
    }

    async fn delta_one(self: &Arc<Self>, plan: &Arc<PartPlan>, pool: &Arc<Semaphore>) {
        let Ok(_permit) = Arc::clone(pool).acquire_owned().await else {
            return;
        };

        let sender = Arc::clone(&self.sender);
        let plan_job = Arc::clone(plan);
        let sent = tokio::task::spawn_blocking(move || {
            sender.send_delta(&plan_job.delta_path, &plan_job.cache_dir, plan_job.partition)
        })
        .await
        .unwrap_or_else(|join| Err(SnapshotError::StorageFailed(join.to_string())));

        if let Err(err) = sent {
            self.accept_exception(err);
        }
    }

    fn release_windows(&self, plans: &[Arc<PartPlan>]) {
        for plan in plans {
            self.cache.remove_page_interceptor(plan.partition, &plan.delta);
            let _ = plan.delta.close();
        }
    }

    fn finalize(&self) {
        // Close any windows left open by an abort before or during the
        // copy stage.
        if let Some(startup) = self.startup.lock().expect("startup lock poisoned").take() {
            self.release_windows(&startup.plans);
        }

        let outcome = match self.poison.get() {
            None => match self.sender.close(None) {
                Ok(()) => {
                    self.transition(TaskState::Done);
                    info!(name = %self.name, "snapshot task done");
                    Ok(())
                }
                Err(err) => {
                    let err = self.poison.poison(err);
                    self.transition(TaskState::Failed);
                    Err(err)
                }
            },
            Some(err) => {
                if let Err(close_err) = self.sender.close(Some(&err)) {
                    warn!(name = %self.name, %close_err, "sender cleanup failed");
                }
                if err.is_cancellation() {
                    self.transition(TaskState::Cancelled);
                } else {
                    self.transition(TaskState::Failed);
                }
                Err(err)
            }
        };

        if let Err(err) = &outcome {
            info!(name = %self.name, %err, "snapshot task finished with error");
        }

        // The per-snapshot temp directory holds only this task's deltas.
        if self.tmp_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.tmp_dir) {
                warn!(name = %self.name, %err, "failed to clean snapshot temp dir");
            }
        }
    }
}
