//! Cluster snapshot coordinator
//!
//! The two-phase distributed process behind `create_snapshot`. The
//! origin node admits the request under the single `snp_op` mutex,
//! broadcasts START, gathers one phase ack per baseline node, broadcasts
//! END, gathers the end acks, and completes the user future.
//!
//! The coordinator is a pure state machine: it owns no I/O. The engine
//! feeds it discovery messages, phase acks and node-leave events, and
//! executes the actions it returns. Checks of the in-flight flag outside
//! the mutex are advisory only; admission, completion and resets all run
//! under it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterService, NodeId, SnapshotPhase, SnapshotStartDiscovery};
use crate::errors::{SnapshotError, SnapshotResult};
use crate::layout;

/// Side effects the engine must carry out after feeding the coordinator.
#[derive(Debug)]
pub enum CoordinatorAction {
    /// Broadcast the END discovery for the current run (origin only)
    BroadcastEnd { request_id: Uuid, has_error: bool },
    /// The run finished; record metrics (origin only; the user future is
    /// already completed)
    Finished { name: String, result: SnapshotResult<()> },
    /// Abort local work for the current run: the origin is gone
    AbortLocal { name: String, error: SnapshotError },
}

/// What a node should do with a START broadcast.
#[derive(Debug)]
pub enum StartDecision {
    /// Create and schedule a local task. `lost` names a locally admitted
    /// proposal that this linearized START superseded; its future is
    /// already completed with `AlreadyInProgress`.
    Participate { lost: Option<String> },
    /// Not a participant of this run
    Ignore,
    /// Reject: another run is already in flight (the loser of two
    /// concurrent proposals)
    Reject(SnapshotError),
}

struct InFlight {
    request_id: Uuid,
    name: String,
    origin: NodeId,
    /// Whether this run's own START broadcast was observed yet; an
    /// admitted-but-unobserved proposal loses to any earlier linearized
    /// START.
    observed_start: bool,
    baseline: BTreeSet<NodeId>,
    departed: BTreeSet<NodeId>,
    start_acks: BTreeMap<NodeId, Option<SnapshotError>>,
    end_acks: BTreeMap<NodeId, Option<SnapshotError>>,
    end_broadcast: bool,
    first_error: Option<SnapshotError>,
    done: Option<oneshot::Sender<SnapshotResult<()>>>,
}

impl InFlight {
    fn record_error(&mut self, err: SnapshotError) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

/// What a node owes the origin when an END broadcast arrives.
#[derive(Debug)]
pub enum EndDuty {
    /// Clean up the local snapshot output and ack
    Cleanup { name: String, has_error: bool, origin: NodeId },
    /// Nothing was created for this run (it was rejected here); ack only
    AckOnly { origin: NodeId },
    /// Not this node's run
    NotMine,
}

/// Per-node snapshot process coordinator.
pub struct ClusterCoordinator {
    local: NodeId,
    state: Mutex<Option<InFlight>>,
    /// Runs this node rejected, by request id: their END still needs an
    /// ack so the losing coordinator can finish.
    rejected: Mutex<BTreeMap<Uuid, NodeId>>,
}

impl ClusterCoordinator {
    /// Coordinator for one node.
    pub fn new(local: NodeId) -> Self {
        Self { local, state: Mutex::new(None), rejected: Mutex::new(BTreeMap::new()) }
    }

    /// Advisory in-flight check.
    pub fn is_snapshot_creating(&self) -> bool {
        self.state.lock().expect("snp_op mutex poisoned").is_some()
    }

    /// Name of the in-flight run, if any.
    pub fn current_name(&self) -> Option<String> {
        self.state
            .lock()
            .expect("snp_op mutex poisoned")
            .as_ref()
            .map(|run| run.name.clone())
    }

    /// Admit a new cluster snapshot on the origin node.
    ///
    /// Runs every pre-check under the `snp_op` mutex and installs the
    /// in-flight run. Returns the START message to broadcast and the
    /// receiver behind the user-visible future.
    pub fn admit(
        &self,
        name: &str,
        cluster: &dyn ClusterService,
        snapshot_root: &Path,
        group_ids: Vec<i32>,
    ) -> SnapshotResult<(SnapshotStartDiscovery, oneshot::Receiver<SnapshotResult<()>>)> {
        let mut state = self.state.lock().expect("snp_op mutex poisoned");

        if !cluster.is_active() {
            return Err(SnapshotError::ClusterInactive);
        }

        let baseline = cluster.baseline();
        if baseline.is_empty() {
            return Err(SnapshotError::NoBaseline);
        }

        for node in cluster.nodes() {
            if !cluster.supports_snapshots(node) {
                return Err(SnapshotError::UnsupportedByPeer(node));
            }
        }

        if let Some(run) = state.as_ref() {
            return Err(SnapshotError::AlreadyInProgress(run.name.clone()));
        }

        if layout::snapshot_dir(snapshot_root, name).exists() {
            return Err(SnapshotError::NameExists(name.to_string()));
        }

        let request_id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();

        *state = Some(InFlight {
            request_id,
            name: name.to_string(),
            origin: self.local,
            observed_start: false,
            baseline: baseline.clone(),
            departed: BTreeSet::new(),
            start_acks: BTreeMap::new(),
            end_acks: BTreeMap::new(),
            end_broadcast: false,
            first_error: None,
            done: Some(done_tx),
        });

        info!(name, %request_id, nodes = baseline.len(), "cluster snapshot admitted");

        Ok((
            SnapshotStartDiscovery {
                request_id,
                name: name.to_string(),
                origin: self.local,
                group_ids,
                baseline,
            },
            done_rx,
        ))
    }

    /// Handle a START broadcast on any node.
    pub fn on_start_discovery(&self, msg: &SnapshotStartDiscovery) -> StartDecision {
        let mut state = self.state.lock().expect("snp_op mutex poisoned");

        if !msg.baseline.contains(&self.local) {
            return StartDecision::Ignore;
        }

        enum Verdict {
            OwnRun,
            OursLost(String),
            Busy(String),
            Fresh,
        }

        let verdict = match state.as_mut() {
            // The origin installed the run at admission.
            Some(run) if run.request_id == msg.request_id => {
                run.observed_start = true;
                Verdict::OwnRun
            }
            // Our own proposal was admitted but the discovery transport
            // linearized this one first: ours loses.
            Some(run) if run.origin == self.local && !run.observed_start => {
                if let Some(done) = run.done.take() {
                    let _ = done.send(Err(SnapshotError::AlreadyInProgress(msg.name.clone())));
                }
                Verdict::OursLost(run.name.clone())
            }
            // A run is already linearized and in flight.
            Some(run) => Verdict::Busy(run.name.clone()),
            None => Verdict::Fresh,
        };

        let install = |state: &mut Option<InFlight>| {
            *state = Some(InFlight {
                request_id: msg.request_id,
                name: msg.name.clone(),
                origin: msg.origin,
                observed_start: true,
                baseline: msg.baseline.clone(),
                departed: BTreeSet::new(),
                start_acks: BTreeMap::new(),
                end_acks: BTreeMap::new(),
                end_broadcast: false,
                first_error: None,
                done: None,
            });
        };

        match verdict {
            Verdict::OwnRun => StartDecision::Participate { lost: None },
            Verdict::OursLost(lost) => {
                warn!(
                    winner = %msg.name,
                    loser = %lost,
                    "concurrent snapshot proposal lost the discovery race"
                );
                install(&mut state);
                StartDecision::Participate { lost: Some(lost) }
            }
            Verdict::Busy(current) => {
                warn!(
                    name = %msg.name,
                    current = %current,
                    "concurrent snapshot proposal rejected"
                );
                // The rejected run's END phase still expects an ack from
                // this node.
                self.rejected
                    .lock()
                    .expect("rejected map poisoned")
                    .insert(msg.request_id, msg.origin);
                StartDecision::Reject(SnapshotError::AlreadyInProgress(current))
            }
            Verdict::Fresh => {
                install(&mut state);
                StartDecision::Participate { lost: None }
            }
        }
    }

    /// Handle an END broadcast; returns what this node owes the origin.
    pub fn on_end_discovery(&self, request_id: Uuid, has_error: bool) -> EndDuty {
        if let Some(origin) =
            self.rejected.lock().expect("rejected map poisoned").remove(&request_id)
        {
            return EndDuty::AckOnly { origin };
        }

        let mut state = self.state.lock().expect("snp_op mutex poisoned");
        let Some(run) = state.as_mut() else {
            return EndDuty::NotMine;
        };
        if run.request_id != request_id {
            return EndDuty::NotMine;
        }

        // The run stays open until the engine sent the END ack
        // (participants then call `forget_participant`); the origin holds
        // it until every end ack arrived.
        debug!(name = %run.name, has_error, "END phase received");
        EndDuty::Cleanup { name: run.name.clone(), has_error, origin: run.origin }
    }

    /// Roll back an admitted run whose START broadcast never went out.
    pub fn reset(&self, request_id: Uuid) {
        let mut state = self.state.lock().expect("snp_op mutex poisoned");
        if let Some(run) = state.as_ref() {
            if run.request_id == request_id {
                *state = None;
            }
        }
    }

    /// Drop a participant's view of the run after its END ack was sent.
    pub fn forget_participant(&self, request_id: Uuid) {
        let mut state = self.state.lock().expect("snp_op mutex poisoned");
        if let Some(run) = state.as_ref() {
            if run.request_id == request_id && run.origin != self.local {
                *state = None;
            }
        }
    }

    /// Record a phase ack on the origin.
    pub fn record_ack(
        &self,
        from: NodeId,
        request_id: Uuid,
        phase: SnapshotPhase,
        error: Option<SnapshotError>,
        live_baseline: &BTreeSet<NodeId>,
    ) -> Vec<CoordinatorAction> {
        let mut state = self.state.lock().expect("snp_op mutex poisoned");
        let Some(run) = state.as_mut() else {
            return Vec::new();
        };
        if run.request_id != request_id || run.origin != self.local {
            return Vec::new();
        }

        if let Some(err) = &error {
            run.record_error(err.clone());
        }
        match phase {
            SnapshotPhase::Start => {
                run.start_acks.insert(from, error);
            }
            SnapshotPhase::End => {
                run.end_acks.insert(from, error);
            }
        }

        Self::advance(&mut state, live_baseline)
    }

    /// Handle a node leave on any node.
    pub fn on_node_left(
        &self,
        node: NodeId,
        live_baseline: &BTreeSet<NodeId>,
    ) -> Vec<CoordinatorAction> {
        // A rejected run whose origin is gone will never broadcast END.
        self.rejected
            .lock()
            .expect("rejected map poisoned")
            .retain(|_, origin| *origin != node);

        let mut state = self.state.lock().expect("snp_op mutex poisoned");
        let Some(run) = state.as_mut() else {
            return Vec::new();
        };
        if !run.baseline.contains(&node) {
            return Vec::new();
        }

        let err = SnapshotError::TopologyChanged(format!("{} left during the snapshot", node));

        if run.origin == node {
            // The coordinator itself is gone; abort locally and reset.
            let name = run.name.clone();
            *state = None;
            return vec![CoordinatorAction::AbortLocal { name, error: err }];
        }

        if run.origin != self.local {
            return Vec::new();
        }

        // Origin: the departed node will never ack; record synthetic
        // failures for whatever it still owes. If END is not broadcast
        // yet, `advance` fills its END ack when it goes out.
        run.record_error(err.clone());
        run.departed.insert(node);
        run.start_acks.entry(node).or_insert_with(|| Some(err.clone()));
        if run.end_broadcast {
            run.end_acks.entry(node).or_insert_with(|| Some(err));
        }

        Self::advance(&mut state, live_baseline)
    }

    /// Move the origin's run forward when a phase completed.
    fn advance(
        state: &mut Option<InFlight>,
        live_baseline: &BTreeSet<NodeId>,
    ) -> Vec<CoordinatorAction> {
        let Some(run) = state.as_mut() else {
            return Vec::new();
        };
        let mut actions = Vec::new();

        let expected = run.baseline.len();

        if !run.end_broadcast && run.start_acks.len() == expected {
            run.end_broadcast = true;
            for node in run.departed.clone() {
                run.end_acks.entry(node).or_insert_with(|| {
                    Some(SnapshotError::TopologyChanged(format!(
                        "{} left during the snapshot",
                        node
                    )))
                });
            }
            actions.push(CoordinatorAction::BroadcastEnd {
                request_id: run.request_id,
                has_error: run.first_error.is_some(),
            });
        }

        if run.end_broadcast && run.end_acks.len() == expected {
            let mut result = match run.first_error.take() {
                Some(err) => Err(err),
                None => Ok(()),
            };

            // No node may depart between START and END.
            if result.is_ok() && *live_baseline != run.baseline {
                result = Err(SnapshotError::TopologyChanged(
                    "baseline changed between the START and END phases".to_string(),
                ));
            }

            if let Some(done) = run.done.take() {
                let _ = done.send(result.clone());
            }

            actions.push(CoordinatorAction::Finished { name: run.name.clone(), result });
            *state = None;
        }

        actions
    }
}
