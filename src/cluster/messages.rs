//! Snapshot wire messages
//!
//! Discovery messages drive the two-phase cluster process and are
//! topology-affecting: the START broadcast forces a partition-map
//! exchange so every baseline node sees a quiesced partition topology
//! before its task starts. Point-to-point messages carry remote snapshot
//! requests and per-node phase results back to the coordinator.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::NodeId;

/// Phase of the two-phase snapshot process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPhase {
    /// Every baseline node creates and schedules its task
    Start,
    /// Every baseline node finalizes: cleanup on error, marker clear
    End,
}

/// Discovery broadcast starting a cluster snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStartDiscovery {
    /// Identity of the two-phase process run
    pub request_id: Uuid,
    /// Cluster-wide unique snapshot name
    pub name: String,
    /// Node that initiated the snapshot and gathers phase results
    pub origin: NodeId,
    /// Cache groups included in the snapshot
    pub group_ids: Vec<i32>,
    /// Baseline topology the snapshot is defined over
    pub baseline: BTreeSet<NodeId>,
}

/// Discovery broadcast finishing a cluster snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEndDiscovery {
    /// Identity of the two-phase process run
    pub request_id: Uuid,
    /// True when any participant failed; every node then deletes its
    /// local snapshot directory
    pub has_error: bool,
}

/// Discovery messages handled by the snapshot engine.
///
/// Modeled as a tagged sum matched in the single custom-message handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    SnapshotStart(SnapshotStartDiscovery),
    SnapshotEnd(SnapshotEndDiscovery),
}

/// Point-to-point messages between snapshot engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeMessage {
    /// Request the target to stream the given partitions back
    SnapshotRequest {
        request_id: Uuid,
        name: String,
        /// Selected partitions per group; `None` means all local
        /// partitions of the group
        parts: BTreeMap<i32, Option<BTreeSet<i32>>>,
    },

    /// Target's answer to a [`NodeMessage::SnapshotRequest`]
    SnapshotResponse {
        request_id: Uuid,
        name: String,
        error_message: Option<String>,
    },

    /// A participant's result for one phase, sent to the coordinator
    PhaseAck {
        request_id: Uuid,
        phase: SnapshotPhase,
        error: Option<crate::errors::SnapshotError>,
    },
}
