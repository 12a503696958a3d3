//! # Snapshot Engine Errors
//!
//! Error taxonomy for the snapshot engine.
//!
//! Admission failures are surfaced synchronously to the caller. Failures
//! after admission are always recovered locally (directory deletion,
//! marker clear) and then reported through the snapshot future; the
//! cluster completes the END phase even when some participants failed.
//!
//! Errors are `Clone` so a single failure can poison a sender, fail a
//! task and complete a future without fighting over ownership; I/O causes
//! are therefore carried as rendered strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::NodeId;

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Snapshot engine errors
///
/// Serializable: a participant's failure travels back to the coordinator
/// inside its phase ack.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotError {
    // ==================
    // Admission Errors
    // ==================
    /// Another cluster snapshot is running
    #[error("snapshot operation is already in progress: {0}")]
    AlreadyInProgress(String),

    /// Snapshot directory already exists on disk
    #[error("snapshot with the given name already exists: {0}")]
    NameExists(String),

    /// Cluster is not active
    #[error("cluster is inactive")]
    ClusterInactive,

    /// No baseline topology is set
    #[error("no baseline topology to snapshot")]
    NoBaseline,

    /// A live node does not support the snapshot feature
    #[error("snapshots are not supported by node {0}")]
    UnsupportedByPeer(NodeId),

    // ==================
    // Topology Errors
    // ==================
    /// A baseline node left during the run
    #[error("baseline topology changed during the snapshot operation: {0}")]
    TopologyChanged(String),

    /// A selected cache group was destroyed during the window
    #[error("cache group was stopped during the snapshot operation: group {0}")]
    CacheGroupStopped(i32),

    /// Local task name collision
    #[error("snapshot task is already scheduled: {0}")]
    AlreadyScheduled(String),

    // ==================
    // Storage Errors
    // ==================
    /// I/O failure against a page store, delta file or snapshot directory
    #[error("storage operation failed: {0}")]
    StorageFailed(String),

    /// Page integrity check failed
    #[error("page integrity check failed: {0}")]
    InvalidPage(String),

    // ==================
    // Transmission Errors
    // ==================
    /// Transmission sub-call failed
    #[error("snapshot transfer failed: {0}")]
    TransferFailed(String),

    /// Transmission superseded or cancelled; a clean abort, not a fault
    #[error("snapshot transfer cancelled")]
    TransferCancelled,

    // ==================
    // Lifecycle Errors
    // ==================
    /// Snapshot task was cancelled
    #[error("snapshot operation cancelled")]
    Cancelled,

    /// The node is stopping; no new snapshot work is accepted
    #[error("node is shutting down")]
    ShuttingDown,

    /// A pending operation did not clear within the wait window
    #[error("snapshot operation timed out: {0}")]
    Timeout(String),
}

impl SnapshotError {
    /// Wrap an I/O error with path-like context.
    pub fn storage(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        SnapshotError::StorageFailed(format!("{}: {}", context, err))
    }

    /// Wrap an I/O error that occurred while transmitting snapshot data.
    pub fn transfer(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        SnapshotError::TransferFailed(format!("{}: {}", context, err))
    }

    /// True for the cooperative-cancellation family of errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SnapshotError::Cancelled | SnapshotError::TransferCancelled)
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::StorageFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_context_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = SnapshotError::storage("/data/part-0.bin", io);
        assert!(err.to_string().contains("/data/part-0.bin"));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_cancellation_family() {
        assert!(SnapshotError::Cancelled.is_cancellation());
        assert!(SnapshotError::TransferCancelled.is_cancellation());
        assert!(!SnapshotError::ShuttingDown.is_cancellation());
        assert!(!SnapshotError::NoBaseline.is_cancellation());
    }

    #[test]
    fn test_io_conversion() {
        fn read() -> SnapshotResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk fell over"))?;
            Ok(())
        }
        let err = read().unwrap_err();
        assert!(matches!(err, SnapshotError::StorageFailed(_)));
    }
}
