//! Snapshot transmission protocol
//!
//! Partition files and deltas travel between nodes as a stream of typed
//! chunks over an ordered point-to-point channel. A clean partition copy
//! is sent under the `File` policy; its paired delta streams under the
//! `Chunk` policy, where `count` is the delta byte length and zero means
//! no delta pages follow. Every chunk carries [`TransmissionMeta`].

mod receiver;

pub use receiver::{PartConsumer, RemoteReceiverRegistry, RemoteRequestHandle};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::page::PartitionId;

/// How a transmission chunk is interpreted by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkPolicy {
    /// A clean partition file; sender transmits `(offset = 0, len)`
    File,
    /// A delta stream applied page-by-page on arrival
    Chunk,
}

/// Metadata carried by every transmission chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmissionMeta {
    /// Remote request this chunk belongs to
    pub request_id: Uuid,
    /// Snapshot name on the sending node
    pub snapshot_name: String,
    /// Cache group id
    pub group_id: i32,
    /// Partition id; `INDEX_PARTITION` for the group index file
    pub partition_id: i32,
    /// Group directory name under the node database directory
    pub cache_dir: String,
    /// Sender's node database path (`db/<nodeFolder>`)
    pub node_path: String,
    /// Total partitions the whole transmission will deliver
    pub total_parts: u32,
    /// Byte length: total file bytes for `File`, delta byte length for
    /// `Chunk` (zero means no delta follows)
    pub count: u64,
    /// Chunk interpretation
    pub policy: ChunkPolicy,
}

impl TransmissionMeta {
    /// Partition this chunk belongs to.
    pub fn partition(&self) -> PartitionId {
        PartitionId::new(self.group_id, self.partition_id)
    }
}

/// A frame on the transmission channel.
///
/// Payload frames carry a slice of the file or delta named by their
/// metadata; `last` marks the final payload frame of that item. `End`
/// closes a successful transmission; `Error` aborts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotFrame {
    Payload { meta: TransmissionMeta, offset: u64, bytes: Vec<u8>, last: bool },
    End { request_id: Uuid },
    Error { request_id: Uuid, message: String },
}

impl SnapshotFrame {
    /// Request identity carried by this frame.
    pub fn request_id(&self) -> Uuid {
        match self {
            SnapshotFrame::Payload { meta, .. } => meta.request_id,
            SnapshotFrame::End { request_id } => *request_id,
            SnapshotFrame::Error { request_id, .. } => *request_id,
        }
    }
}
