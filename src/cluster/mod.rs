//! Cluster boundary: node identity, discovery and messaging
//!
//! The snapshot engine consumes a narrow slice of the cluster: a view of
//! the live and baseline topology, a total-order discovery broadcast for
//! the two-phase process, ordered point-to-point messages for request
//! handling and phase acks, and an ordered per-link channel for snapshot
//! file transmission.
//!
//! [`LocalCluster`] is the in-process implementation used by tests and
//! embedders; a real transport plugs in behind [`ClusterService`].

mod local;
mod messages;

pub use local::{LocalCluster, LocalClusterNode};
pub use messages::{
    DiscoveryMessage, NodeMessage, SnapshotEndDiscovery, SnapshotPhase, SnapshotStartDiscovery,
};

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SnapshotResult;
use crate::transfer::SnapshotFrame;

/// Identity of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh node id.
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }

    /// The raw uuid.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raw = self.0.as_simple().to_string();
        write!(f, "node-{}", &raw[..8])
    }
}

/// Events delivered to a node's snapshot engine by the cluster.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A discovery broadcast, delivered to every node in the same order
    Discovery(DiscoveryMessage),
    /// A point-to-point message
    Message { from: NodeId, message: NodeMessage },
    /// A snapshot transmission frame
    Frame { from: NodeId, frame: SnapshotFrame },
    /// A node left the topology
    NodeLeft(NodeId),
}

/// Cluster services consumed by the snapshot engine.
pub trait ClusterService: Send + Sync {
    /// Identity of the local node.
    fn local_node(&self) -> NodeId;

    /// Live nodes, including the local one.
    fn nodes(&self) -> BTreeSet<NodeId>;

    /// Live baseline nodes.
    fn baseline(&self) -> BTreeSet<NodeId>;

    /// Whether the cluster is active.
    fn is_active(&self) -> bool;

    /// Whether a node supports the snapshot feature.
    fn supports_snapshots(&self, node: NodeId) -> bool;

    /// Broadcast a discovery message; all nodes observe broadcasts in one
    /// total order.
    fn broadcast_discovery(&self, message: DiscoveryMessage) -> SnapshotResult<()>;

    /// Send a message to one node.
    fn send(&self, to: NodeId, message: NodeMessage) -> SnapshotResult<()>;

    /// Send a transmission frame to one node; frames on one link are
    /// delivered in order.
    fn send_frame(&self, to: NodeId, frame: SnapshotFrame) -> SnapshotResult<()>;
}
