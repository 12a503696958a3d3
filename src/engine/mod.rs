//! Snapshot engine
//!
//! The top-level handle owning all per-engine state: configuration,
//! metastore, coordinator, receiver registry, the task map, the bounded
//! snapshot pool and the shutdown gate. There is no process-wide state;
//! two engines in one process are fully independent, which is also how
//! the loopback cluster tests run.
//!
//! The engine consumes its node's [`ClusterEvent`] queue on one
//! dispatcher task: discovery broadcasts drive the two-phase process,
//! point-to-point messages carry remote requests and phase acks, and
//! transmission frames feed the receiver registry.

mod gate;
mod metrics;

pub use gate::ShutdownGate;
pub use metrics::SnapshotMetrics;

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheEngine;
use crate::cluster::{
    ClusterEvent, ClusterService, DiscoveryMessage, NodeId, NodeMessage, SnapshotEndDiscovery,
    SnapshotPhase, SnapshotStartDiscovery,
};
use crate::config::SnapshotConfig;
use crate::coordinator::{ClusterCoordinator, CoordinatorAction, EndDuty, StartDecision};
use crate::errors::{SnapshotError, SnapshotResult};
use crate::layout;
use crate::metastore::{MetaStore, SNAPSHOT_IN_PROGRESS_KEY};
use crate::recovery::SnapshotRecovery;
use crate::sender::{LocalSink, Poison, RemoteSink, SnapshotSender};
use crate::task::{PartSelection, SnapshotTask};
use crate::transfer::{PartConsumer, RemoteReceiverRegistry};
use crate::verify::{verify_snapshot, VerifyReport};

struct EngineInner {
    cfg: SnapshotConfig,
    cache: Arc<dyn CacheEngine>,
    cluster: Arc<dyn ClusterService>,
    metastore: Arc<MetaStore>,
    coordinator: ClusterCoordinator,
    receiver: RemoteReceiverRegistry,
    tasks: Mutex<HashMap<String, Arc<SnapshotTask>>>,
    remote_serving: Mutex<HashMap<NodeId, String>>,
    pool: Arc<Semaphore>,
    gate: Arc<ShutdownGate>,
    metrics: SnapshotMetrics,
}

/// Cluster-consistent snapshot engine of one node.
#[derive(Clone)]
pub struct SnapshotEngine {
    inner: Arc<EngineInner>,
}

impl SnapshotEngine {
    /// Start the engine: run crash recovery, then consume the node's
    /// cluster events until the queue closes.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        cfg: SnapshotConfig,
        cache: Arc<dyn CacheEngine>,
        cluster: Arc<dyn ClusterService>,
        events: mpsc::UnboundedReceiver<ClusterEvent>,
    ) -> SnapshotResult<Self> {
        cfg.validate()?;

        let metastore = Arc::new(MetaStore::open(&cfg.work_dir)?);

        // Interrupted snapshots die before the engine serves anything.
        let recovery = SnapshotRecovery::new(
            cfg.snapshot_root.clone(),
            cfg.tmp_work_dir(),
            Arc::clone(&metastore),
        );
        recovery.on_ready_for_read()?;
        recovery.on_ready_for_read_write()?;

        fs::create_dir_all(&cfg.snapshot_root)
            .map_err(|e| SnapshotError::storage(cfg.snapshot_root.display(), e))?;

        let inner = Arc::new(EngineInner {
            receiver: RemoteReceiverRegistry::new(cfg.work_dir.join("rmt"), cfg.page_size),
            coordinator: ClusterCoordinator::new(cluster.local_node()),
            pool: Arc::new(Semaphore::new(cfg.pool_size)),
            gate: ShutdownGate::new(),
            metrics: SnapshotMetrics::default(),
            tasks: Mutex::new(HashMap::new()),
            remote_serving: Mutex::new(HashMap::new()),
            cfg,
            cache,
            cluster,
            metastore,
        });

        let dispatcher = Arc::clone(&inner);
        tokio::spawn(async move { dispatcher.dispatch(events).await });

        info!(node = %inner.cluster.local_node(), "snapshot engine started");
        Ok(Self { inner })
    }

    /// Create a cluster-wide snapshot over the full baseline.
    ///
    /// Admission failures surface synchronously; the returned future
    /// resolves when the END phase completed on every baseline node.
    pub fn create_snapshot(
        &self,
        name: &str,
    ) -> SnapshotResult<impl Future<Output = SnapshotResult<()>>> {
        let inner = &self.inner;
        inner.gate.check()?;

        let group_ids: Vec<i32> = inner.cache.groups().iter().map(|g| g.group_id).collect();
        let (start, done) =
            inner.coordinator.admit(name, inner.cluster.as_ref(), &inner.cfg.snapshot_root, group_ids)?;

        inner.metrics.on_start(name);

        if let Err(err) = inner
            .cluster
            .broadcast_discovery(DiscoveryMessage::SnapshotStart(start.clone()))
        {
            inner.coordinator.reset(start.request_id);
            inner.metrics.on_end(name, &Err(err.clone()));
            return Err(err);
        }

        Ok(async move {
            match done.await {
                Ok(result) => result,
                Err(_) => Err(SnapshotError::Cancelled),
            }
        })
    }

    /// Request selected partitions from another node; `consumer` receives
    /// every reconstructed partition file.
    ///
    /// A still-pending prior request to the same node is superseded and
    /// completes with `TransferCancelled`.
    pub fn create_remote_snapshot(
        &self,
        node: NodeId,
        parts: PartSelection,
        consumer: PartConsumer,
    ) -> SnapshotResult<impl Future<Output = SnapshotResult<()>>> {
        let inner = &self.inner;
        let gate_guard = inner.gate.enter()?;

        if node == inner.cluster.local_node() {
            return Err(SnapshotError::TransferFailed(
                "cannot request a remote snapshot from the local node".to_string(),
            ));
        }
        if !inner.cluster.nodes().contains(&node) {
            return Err(SnapshotError::TopologyChanged(format!("{} is not in the cluster", node)));
        }

        let request_id = Uuid::new_v4();
        let name = format!("rmt-{}", request_id.as_simple());
        let (handle, done) = inner.receiver.register(node, request_id, &name, consumer);

        if let Err(err) = inner.cluster.send(
            node,
            NodeMessage::SnapshotRequest { request_id, name: name.clone(), parts },
        ) {
            inner.receiver.cancel(node, request_id, err.clone());
            return Err(err);
        }

        // The handshake watchdog: a target that never answers abandons
        // the request after the configured window.
        {
            let registry = Arc::clone(&self.inner);
            let timeout = inner.cfg.transfer_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !handle.responded() {
                    registry.receiver.cancel(
                        node,
                        request_id,
                        SnapshotError::Timeout(format!(
                            "remote snapshot handshake with {} did not complete",
                            node
                        )),
                    );
                }
            });
        }

        info!(to = %node, name, "remote snapshot requested");
        Ok(async move {
            let _gate = gate_guard;
            match done.await {
                Ok(result) => result,
                Err(_) => Err(SnapshotError::Cancelled),
            }
        })
    }

    /// Names of completed snapshots on this node.
    pub fn get_snapshots(&self) -> SnapshotResult<Vec<String>> {
        layout::list_snapshots(&self.inner.cfg.snapshot_root)
    }

    /// Advisory: is a cluster snapshot in flight on this node?
    pub fn is_snapshot_creating(&self) -> bool {
        self.inner.coordinator.is_snapshot_creating()
    }

    /// Signal that cache groups were stopped: every task covering one of
    /// them fails with `CacheGroupStopped`.
    pub fn on_cache_groups_stopped(&self, group_ids: &[i32]) {
        let tasks = self.inner.tasks.lock().expect("task map poisoned");
        for task in tasks.values() {
            if let Some(group) = task.group_ids().iter().find(|g| group_ids.contains(g)) {
                task.accept_exception(SnapshotError::CacheGroupStopped(*group));
            }
        }
    }

    /// Verify a completed local snapshot.
    pub fn check_snapshot(&self, name: &str) -> SnapshotResult<VerifyReport> {
        verify_snapshot(&self.inner.cfg.snapshot_root, name)
    }

    /// Snapshot metrics.
    pub fn metrics(&self) -> &SnapshotMetrics {
        &self.inner.metrics
    }

    /// Stop the engine: reject new work and block until outstanding
    /// snapshot work drained. Call from a blocking context.
    pub fn stop(&self) {
        info!(node = %self.inner.cluster.local_node(), "snapshot engine stopping");
        self.inner.gate.stop();
    }
}

impl EngineInner {
    async fn dispatch(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ClusterEvent::Discovery(DiscoveryMessage::SnapshotStart(msg)) => {
                    self.handle_start_discovery(msg);
                }
                ClusterEvent::Discovery(DiscoveryMessage::SnapshotEnd(msg)) => {
                    self.handle_end_discovery(msg);
                }
                ClusterEvent::Message { from, message } => match message {
                    NodeMessage::SnapshotRequest { request_id, name, parts } => {
                        self.handle_remote_request(from, request_id, name, parts);
                    }
                    NodeMessage::SnapshotResponse { request_id, error_message, .. } => {
                        self.receiver.on_response(from, request_id, error_message);
                    }
                    NodeMessage::PhaseAck { request_id, phase, error } => {
                        let actions = self.coordinator.record_ack(
                            from,
                            request_id,
                            phase,
                            error,
                            &self.cluster.baseline(),
                        );
                        self.run_actions(actions);
                    }
                },
                ClusterEvent::Frame { from, frame } => {
                    self.receiver.handle_frame(from, frame);
                }
                ClusterEvent::NodeLeft(node) => {
                    self.handle_node_left(node);
                }
            }
        }
        debug!("cluster event queue closed; dispatcher exiting");
    }

    fn run_actions(self: &Arc<Self>, actions: Vec<CoordinatorAction>) {
        for action in actions {
            match action {
                CoordinatorAction::BroadcastEnd { request_id, has_error } => {
                    let end = SnapshotEndDiscovery { request_id, has_error };
                    if let Err(err) =
                        self.cluster.broadcast_discovery(DiscoveryMessage::SnapshotEnd(end))
                    {
                        warn!(%err, "failed to broadcast snapshot END");
                    }
                }
                CoordinatorAction::Finished { name, result } => {
                    self.metrics.on_end(&name, &result);
                    match &result {
                        Ok(()) => info!(name, "cluster snapshot finished"),
                        Err(err) => info!(name, %err, "cluster snapshot failed"),
                    }
                }
                CoordinatorAction::AbortLocal { name, error } => {
                    self.abort_local(&name, error);
                }
            }
        }
    }

    /// START phase on a participant: create, schedule and run the local
    /// task, then ack its outcome to the origin.
    fn handle_start_discovery(self: &Arc<Self>, msg: SnapshotStartDiscovery) {
        let decision = self.coordinator.on_start_discovery(&msg);
        match decision {
            StartDecision::Ignore => {}
            StartDecision::Reject(err) => {
                self.send_ack(msg.origin, msg.request_id, SnapshotPhase::Start, Some(err));
            }
            StartDecision::Participate { lost } => {
                if let Some(lost) = lost {
                    self.metrics.on_end(
                        &lost,
                        &Err(SnapshotError::AlreadyInProgress(msg.name.clone())),
                    );
                }
                if let Err(err) = self.spawn_local_task(&msg) {
                    self.send_ack(msg.origin, msg.request_id, SnapshotPhase::Start, Some(err));
                }
            }
        }
    }

    fn spawn_local_task(self: &Arc<Self>, msg: &SnapshotStartDiscovery) -> SnapshotResult<()> {
        let gate_guard = self.gate.enter()?;

        let poison = Poison::new();
        let baseline = msg.baseline.iter().map(|n| n.to_string()).collect();
        let sink: Arc<dyn SnapshotSender> = Arc::new(LocalSink::new(
            &msg.name,
            &self.cfg.snapshot_root,
            Arc::clone(&self.cache),
            Arc::clone(&self.metastore),
            Arc::clone(&poison),
            baseline,
        ));

        let parts: PartSelection = msg.group_ids.iter().map(|g| (*g, None)).collect();
        let task = SnapshotTask::new(
            &msg.name,
            msg.request_id,
            msg.origin,
            parts,
            Arc::clone(&self.cache),
            sink,
            poison,
            self.cfg.tmp_work_dir().join(&msg.name),
        );

        self.register_task(&task)?;
        task.schedule();

        tokio::spawn(Arc::clone(&task).run(Arc::clone(&self.pool)));

        if let Err(err) = self.cache.force_checkpoint("cluster snapshot") {
            task.accept_exception(err.clone());
        }

        // Ack once the local work reached a terminal state.
        let engine = Arc::clone(self);
        let origin = msg.origin;
        let request_id = msg.request_id;
        tokio::spawn(async move {
            let result = task.wait_done().await;
            engine.unregister_task(task.name());
            engine.send_ack(origin, request_id, SnapshotPhase::Start, result.err());
            drop(gate_guard);
        });

        Ok(())
    }

    /// END phase on every participant: cleanup, marker clear, ack.
    fn handle_end_discovery(self: &Arc<Self>, msg: SnapshotEndDiscovery) {
        let (name, has_error, origin) =
            match self.coordinator.on_end_discovery(msg.request_id, msg.has_error) {
                EndDuty::Cleanup { name, has_error, origin } => (name, has_error, origin),
                EndDuty::AckOnly { origin } => {
                    self.send_ack(origin, msg.request_id, SnapshotPhase::End, None);
                    return;
                }
                EndDuty::NotMine => return,
            };

        let mut cleanup: SnapshotResult<()> = Ok(());

        if has_error {
            let dir = layout::snapshot_dir(&self.cfg.snapshot_root, &name);
            if dir.exists() {
                cleanup = fs::remove_dir_all(&dir)
                    .map_err(|e| SnapshotError::storage(dir.display(), e));
            }
        }

        if cleanup.is_ok() {
            let _cp = self.cache.checkpoint_lock().read().expect("checkpoint lock poisoned");
            cleanup = self.metastore.remove(SNAPSHOT_IN_PROGRESS_KEY);
        }

        self.send_ack(origin, msg.request_id, SnapshotPhase::End, cleanup.err());
        self.coordinator.forget_participant(msg.request_id);
    }

    /// Inbound remote snapshot request: stream the selected partitions
    /// back to the requester.
    fn handle_remote_request(
        self: &Arc<Self>,
        from: NodeId,
        request_id: Uuid,
        name: String,
        parts: PartSelection,
    ) {
        let respond = |error: Option<SnapshotError>| {
            let message = NodeMessage::SnapshotResponse {
                request_id,
                name: name.clone(),
                error_message: error.map(|e| e.to_string()),
            };
            if let Err(err) = self.cluster.send(from, message) {
                debug!(to = %from, %err, "snapshot response undeliverable");
            }
        };

        let gate_guard = match self.gate.enter() {
            Ok(guard) => guard,
            Err(err) => return respond(Some(err)),
        };

        // One in-flight remote snapshot per requester: a newer request
        // supersedes the running one.
        if let Some(prior_name) =
            self.remote_serving.lock().expect("remote map poisoned").insert(from, name.clone())
        {
            if let Some(prior) = self.tasks.lock().expect("task map poisoned").get(&prior_name) {
                info!(from = %from, superseded = prior_name, "remote snapshot task superseded");
                prior.accept_exception(SnapshotError::TransferCancelled);
            }
        }

        let poison = Poison::new();
        let sink: Arc<dyn SnapshotSender> = Arc::new(RemoteSink::new(
            Arc::clone(&self.cluster),
            from,
            request_id,
            &name,
            self.cache.node_path(),
            self.cfg.chunk_size,
            Arc::clone(&poison),
        ));

        let task = SnapshotTask::new(
            &name,
            request_id,
            from,
            parts,
            Arc::clone(&self.cache),
            sink,
            poison,
            self.cfg.tmp_work_dir().join(&name),
        );

        if let Err(err) = self.register_task(&task) {
            return respond(Some(err));
        }
        task.schedule();
        tokio::spawn(Arc::clone(&task).run(Arc::clone(&self.pool)));

        if let Err(err) = self.cache.force_checkpoint("remote snapshot") {
            task.accept_exception(err.clone());
        }

        respond(None);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _ = task.wait_done().await;
            engine.unregister_task(task.name());
            let mut serving = engine.remote_serving.lock().expect("remote map poisoned");
            if serving.get(&from).map(|n| n == task.name()).unwrap_or(false) {
                serving.remove(&from);
            }
            drop(serving);
            drop(gate_guard);
        });
    }

    fn handle_node_left(self: &Arc<Self>, node: NodeId) {
        debug!(node = %node, "node left");

        let actions = self.coordinator.on_node_left(node, &self.cluster.baseline());
        self.run_actions(actions);

        // Tasks whose origin is gone have nobody to report to.
        let tasks = self.tasks.lock().expect("task map poisoned");
        for task in tasks.values() {
            if task.origin() == node {
                task.accept_exception(SnapshotError::TopologyChanged(format!(
                    "{} has left",
                    node
                )));
            }
        }
        drop(tasks);

        self.receiver.on_node_left(node);
    }

    /// Abort the current run locally: the coordinator node is gone.
    fn abort_local(self: &Arc<Self>, name: &str, error: SnapshotError) {
        warn!(name, %error, "aborting local snapshot work");

        if let Some(task) = self.tasks.lock().expect("task map poisoned").get(name) {
            task.accept_exception(error);
        }

        let dir = layout::snapshot_dir(&self.cfg.snapshot_root, name);
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(name, %err, "failed to delete aborted snapshot");
            }
        }

        let _cp = self.cache.checkpoint_lock().read().expect("checkpoint lock poisoned");
        if let Err(err) = self.metastore.remove(SNAPSHOT_IN_PROGRESS_KEY) {
            warn!(name, %err, "failed to clear snapshot marker");
        }
    }

    fn register_task(&self, task: &Arc<SnapshotTask>) -> SnapshotResult<()> {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if tasks.contains_key(task.name()) {
            return Err(SnapshotError::AlreadyScheduled(task.name().to_string()));
        }
        tasks.insert(task.name().to_string(), Arc::clone(task));
        Ok(())
    }

    fn unregister_task(&self, name: &str) {
        self.tasks.lock().expect("task map poisoned").remove(name);
    }

    fn send_ack(
        &self,
        origin: NodeId,
        request_id: Uuid,
        phase: SnapshotPhase,
        error: Option<SnapshotError>,
    ) {
        let ack = NodeMessage::PhaseAck { request_id, phase, error };
        if let Err(err) = self.cluster.send(origin, ack) {
            debug!(to = %origin, %err, "phase ack undeliverable");
        }
    }
}
