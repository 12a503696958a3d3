//! In-process loopback cluster
//!
//! Every node owns an unbounded FIFO event queue. Discovery broadcasts
//! are fanned out under one lock, which is the linearization point: all
//! nodes observe all broadcasts in the same order, so two concurrent
//! snapshot proposals resolve the same way everywhere. Point-to-point
//! messages and transmission frames share the per-node queue, which
//! preserves per-link ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use super::{ClusterEvent, ClusterService, DiscoveryMessage, NodeId, NodeMessage};
use crate::errors::{SnapshotError, SnapshotResult};
use crate::transfer::SnapshotFrame;

struct NodeSlot {
    tx: mpsc::UnboundedSender<ClusterEvent>,
    supports_snapshots: bool,
}

struct ClusterState {
    nodes: BTreeMap<NodeId, NodeSlot>,
    baseline: BTreeSet<NodeId>,
    active: bool,
}

/// Shared state of an in-process cluster.
pub struct LocalCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl LocalCluster {
    /// Create an empty, active cluster.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                nodes: BTreeMap::new(),
                baseline: BTreeSet::new(),
                active: true,
            })),
        }
    }

    /// Join a new node; returns its service handle and event queue.
    ///
    /// The node is added to the baseline as well: the loopback cluster
    /// models persistent baseline nodes only.
    pub fn join(&self) -> (Arc<LocalClusterNode>, mpsc::UnboundedReceiver<ClusterEvent>) {
        let id = NodeId::random();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock().expect("cluster lock poisoned");
        state.nodes.insert(id, NodeSlot { tx, supports_snapshots: true });
        state.baseline.insert(id);

        debug!(node = %id, "node joined loopback cluster");

        (Arc::new(LocalClusterNode { id, state: Arc::clone(&self.state) }), rx)
    }

    /// Activate or deactivate the cluster.
    pub fn set_active(&self, active: bool) {
        self.state.lock().expect("cluster lock poisoned").active = active;
    }

    /// Mark a node as not supporting the snapshot feature.
    pub fn set_snapshot_support(&self, node: NodeId, supported: bool) {
        let mut state = self.state.lock().expect("cluster lock poisoned");
        if let Some(slot) = state.nodes.get_mut(&node) {
            slot.supports_snapshots = supported;
        }
    }

    /// Remove a node abruptly; every surviving node observes the leave.
    pub fn kill(&self, node: NodeId) {
        let mut state = self.state.lock().expect("cluster lock poisoned");
        state.nodes.remove(&node);
        state.baseline.remove(&node);
        for slot in state.nodes.values() {
            let _ = slot.tx.send(ClusterEvent::NodeLeft(node));
        }
        debug!(node = %node, "node killed");
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of a [`LocalCluster`].
pub struct LocalClusterNode {
    id: NodeId,
    state: Arc<Mutex<ClusterState>>,
}

impl ClusterService for LocalClusterNode {
    fn local_node(&self) -> NodeId {
        self.id
    }

    fn nodes(&self) -> BTreeSet<NodeId> {
        let state = self.state.lock().expect("cluster lock poisoned");
        state.nodes.keys().copied().collect()
    }

    fn baseline(&self) -> BTreeSet<NodeId> {
        let state = self.state.lock().expect("cluster lock poisoned");
        state.baseline.clone()
    }

    fn is_active(&self) -> bool {
        self.state.lock().expect("cluster lock poisoned").active
    }

    fn supports_snapshots(&self, node: NodeId) -> bool {
        let state = self.state.lock().expect("cluster lock poisoned");
        state.nodes.get(&node).map(|slot| slot.supports_snapshots).unwrap_or(false)
    }

    fn broadcast_discovery(&self, message: DiscoveryMessage) -> SnapshotResult<()> {
        // Fan-out under the cluster lock: the linearization point for
        // concurrent proposals.
        let state = self.state.lock().expect("cluster lock poisoned");
        for slot in state.nodes.values() {
            let _ = slot.tx.send(ClusterEvent::Discovery(message.clone()));
        }
        Ok(())
    }

    fn send(&self, to: NodeId, message: NodeMessage) -> SnapshotResult<()> {
        let state = self.state.lock().expect("cluster lock poisoned");
        let slot = state
            .nodes
            .get(&to)
            .ok_or_else(|| SnapshotError::TopologyChanged(format!("{} has left", to)))?;
        slot.tx
            .send(ClusterEvent::Message { from: self.id, message })
            .map_err(|_| SnapshotError::TopologyChanged(format!("{} has left", to)))
    }

    fn send_frame(&self, to: NodeId, frame: SnapshotFrame) -> SnapshotResult<()> {
        let state = self.state.lock().expect("cluster lock poisoned");
        let slot = state
            .nodes
            .get(&to)
            .ok_or_else(|| SnapshotError::TransferFailed(format!("{} has left", to)))?;
        slot.tx
            .send(ClusterEvent::Frame { from: self.id, frame })
            .map_err(|_| SnapshotError::TransferFailed(format!("{} has left", to)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SnapshotEndDiscovery;
    use uuid::Uuid;

    #[test]
    fn test_join_and_topology() {
        let cluster = LocalCluster::new();
        let (a, _rx_a) = cluster.join();
        let (b, _rx_b) = cluster.join();

        assert_eq!(a.nodes().len(), 2);
        assert_eq!(a.baseline().len(), 2);
        assert!(a.nodes().contains(&b.local_node()));
        assert!(a.is_active());
        assert!(a.supports_snapshots(b.local_node()));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_nodes_in_order() {
        let cluster = LocalCluster::new();
        let (a, mut rx_a) = cluster.join();
        let (_b, mut rx_b) = cluster.join();

        for i in 0..3 {
            a.broadcast_discovery(DiscoveryMessage::SnapshotEnd(SnapshotEndDiscovery {
                request_id: Uuid::from_u128(i),
                has_error: false,
            }))
            .unwrap();
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for i in 0..3u128 {
                match rx.recv().await.unwrap() {
                    ClusterEvent::Discovery(DiscoveryMessage::SnapshotEnd(end)) => {
                        assert_eq!(end.request_id, Uuid::from_u128(i));
                    }
                    other => panic!("unexpected event: {:?}", other),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_dead_node_fails() {
        let cluster = LocalCluster::new();
        let (a, _rx_a) = cluster.join();
        let (b, _rx_b) = cluster.join();

        cluster.kill(b.local_node());

        let result = a.send(
            b.local_node(),
            NodeMessage::SnapshotResponse {
                request_id: Uuid::new_v4(),
                name: "s1".to_string(),
                error_message: None,
            },
        );
        assert!(matches!(result, Err(SnapshotError::TopologyChanged(_))));
    }

    #[tokio::test]
    async fn test_kill_notifies_survivors() {
        let cluster = LocalCluster::new();
        let (_a, mut rx_a) = cluster.join();
        let (b, _rx_b) = cluster.join();

        cluster.kill(b.local_node());

        match rx_a.recv().await.unwrap() {
            ClusterEvent::NodeLeft(node) => assert_eq!(node, b.local_node()),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
