//! Remote snapshot sink
//!
//! Streams partition files and deltas to a requesting node as typed
//! chunks over the ordered point-to-point transmission channel. Clean
//! parts go out under the `File` policy with `(offset = 0, len)`; deltas
//! stream whole under the `Chunk` policy. One remote sink owns one
//! channel and is therefore driven strictly sequentially.
//!
//! Cache configurations and metadata are node-local concerns of the
//! serving side and are not transmitted; partition reconstruction needs
//! only the files and their deltas.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::{Poison, SnapshotSender};
use crate::cluster::{ClusterService, NodeId};
use crate::errors::{SnapshotError, SnapshotResult};
use crate::page::PartitionId;
use crate::transfer::{ChunkPolicy, SnapshotFrame, TransmissionMeta};

/// Sink that streams a snapshot to another node.
pub struct RemoteSink {
    cluster: Arc<dyn ClusterService>,
    target: NodeId,
    request_id: Uuid,
    name: String,
    cache_node_path: String,
    chunk_size: usize,
    total_parts: AtomicU32,
    poison: Arc<Poison>,
    closed: AtomicBool,
}

impl RemoteSink {
    /// Create a sink streaming to `target` for one remote request.
    pub fn new(
        cluster: Arc<dyn ClusterService>,
        target: NodeId,
        request_id: Uuid,
        name: &str,
        cache_node_path: String,
        chunk_size: usize,
        poison: Arc<Poison>,
    ) -> Self {
        Self {
            cluster,
            target,
            request_id,
            name: name.to_string(),
            cache_node_path,
            chunk_size,
            total_parts: AtomicU32::new(0),
            poison,
            closed: AtomicBool::new(false),
        }
    }

    fn run<T>(&self, op: impl FnOnce() -> SnapshotResult<T>) -> SnapshotResult<T> {
        self.poison.check()?;
        op().map_err(|err| self.poison.poison(err))
    }

    fn meta(
        &self,
        partition: PartitionId,
        cache_dir: &str,
        policy: ChunkPolicy,
        count: u64,
    ) -> TransmissionMeta {
        TransmissionMeta {
            request_id: self.request_id,
            snapshot_name: self.name.clone(),
            group_id: partition.group_id,
            partition_id: partition.partition_id,
            cache_dir: cache_dir.to_string(),
            node_path: self.cache_node_path.clone(),
            total_parts: self.total_parts.load(Ordering::Acquire),
            count,
            policy,
        }
    }

    /// Stream `len` bytes of `file` as payload frames of `meta`.
    fn stream(&self, file: &Path, len: u64, meta: TransmissionMeta) -> SnapshotResult<()> {
        if len == 0 {
            self.cluster.send_frame(
                self.target,
                SnapshotFrame::Payload { meta, offset: 0, bytes: Vec::new(), last: true },
            )?;
            return Ok(());
        }

        let mut src = File::open(file).map_err(|e| SnapshotError::transfer(file.display(), e))?;
        let mut offset = 0u64;
        let mut buffer = vec![0u8; self.chunk_size];

        while offset < len {
            // Cooperative cancellation between frames.
            self.poison.check()?;

            let want = buffer.len().min((len - offset) as usize);
            let got = src
                .read(&mut buffer[..want])
                .map_err(|e| SnapshotError::transfer(file.display(), e))?;
            if got == 0 {
                return Err(SnapshotError::TransferFailed(format!(
                    "{} ended {} bytes short",
                    file.display(),
                    len - offset
                )));
            }

            let last = offset + got as u64 == len;
            self.cluster.send_frame(
                self.target,
                SnapshotFrame::Payload {
                    meta: meta.clone(),
                    offset,
                    bytes: buffer[..got].to_vec(),
                    last,
                },
            )?;
            offset += got as u64;
        }

        Ok(())
    }
}

impl SnapshotSender for RemoteSink {
    fn init(&self, total_parts: u32) -> SnapshotResult<()> {
        self.run(|| {
            self.total_parts.store(total_parts, Ordering::Release);
            debug!(name = %self.name, to = %self.target, total_parts, "remote sink initialized");
            Ok(())
        })
    }

    fn send_cache_config(&self, _cfg_file: &Path, _cache_dir: &str) -> SnapshotResult<()> {
        self.poison.check()
    }

    fn send_type_metadata(&self, _types: &[u8]) -> SnapshotResult<()> {
        self.poison.check()
    }

    fn send_mapping_metadata(&self, _mappings: &[u8]) -> SnapshotResult<()> {
        self.poison.check()
    }

    fn send_part(
        &self,
        file: &Path,
        cache_dir: &str,
        partition: PartitionId,
        len: u64,
    ) -> SnapshotResult<()> {
        self.run(|| {
            let meta = self.meta(partition, cache_dir, ChunkPolicy::File, len);
            self.stream(file, len, meta)?;
            debug!(to = %self.target, %partition, len, "partition streamed");
            Ok(())
        })
    }

    fn send_delta(
        &self,
        delta_file: &Path,
        cache_dir: &str,
        partition: PartitionId,
    ) -> SnapshotResult<()> {
        self.run(|| {
            let len = std::fs::metadata(delta_file)
                .map_err(|e| SnapshotError::transfer(delta_file.display(), e))?
                .len();
            let meta = self.meta(partition, cache_dir, ChunkPolicy::Chunk, len);
            self.stream(delta_file, len, meta)?;
            debug!(to = %self.target, %partition, len, "delta streamed");
            Ok(())
        })
    }

    fn close(&self, error: Option<&SnapshotError>) -> SnapshotResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let frame = match error {
            None => SnapshotFrame::End { request_id: self.request_id },
            Some(err) => SnapshotFrame::Error {
                request_id: self.request_id,
                message: err.to_string(),
            },
        };

        // Best effort: the peer may already be gone on the error path.
        let sent = self.cluster.send_frame(self.target, frame);
        match error {
            None => {
                sent?;
                info!(name = %self.name, to = %self.target, "remote snapshot streamed");
            }
            Some(err) => {
                info!(name = %self.name, to = %self.target, %err, "remote snapshot aborted");
            }
        }
        Ok(())
    }

    fn sequential(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterEvent, LocalCluster};
    use tempfile::TempDir;

    fn collect_payloads(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<ClusterEvent>,
    ) -> Vec<SnapshotFrame> {
        let mut frames = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ClusterEvent::Frame { frame, .. } = event {
                frames.push(frame);
            }
        }
        frames
    }

    fn sink_to(
        cluster: &LocalCluster,
        chunk_size: usize,
    ) -> (RemoteSink, tokio::sync::mpsc::UnboundedReceiver<ClusterEvent>) {
        let (sender_node, _sender_rx) = cluster.join();
        let (receiver_node, receiver_rx) = cluster.join();

        let sink = RemoteSink::new(
            sender_node,
            receiver_node.local_node(),
            Uuid::new_v4(),
            "rmt-1",
            "db/node-a".to_string(),
            chunk_size,
            Poison::new(),
        );
        (sink, receiver_rx)
    }

    #[tokio::test]
    async fn test_part_streams_in_order_with_last_mark() {
        let cluster = LocalCluster::new();
        let (sink, mut rx) = sink_to(&cluster, 1024);

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("part-0.bin");
        std::fs::write(&file, vec![0x5A; 4096]).unwrap();

        sink.init(1).unwrap();
        sink.send_part(&file, "default", PartitionId::new(1, 0), 4096).unwrap();

        let frames = collect_payloads(&mut rx);
        assert_eq!(frames.len(), 4);

        let mut expected_offset = 0u64;
        for (i, frame) in frames.iter().enumerate() {
            match frame {
                SnapshotFrame::Payload { meta, offset, bytes, last } => {
                    assert_eq!(meta.policy, ChunkPolicy::File);
                    assert_eq!(meta.count, 4096);
                    assert_eq!(meta.total_parts, 1);
                    assert_eq!(*offset, expected_offset);
                    assert_eq!(bytes.len(), 1024);
                    assert_eq!(*last, i == 3);
                    expected_offset += bytes.len() as u64;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_empty_delta_sends_single_empty_frame() {
        let cluster = LocalCluster::new();
        let (sink, mut rx) = sink_to(&cluster, 1024);

        let dir = TempDir::new().unwrap();
        let delta = dir.path().join("part-0.bin.delta");
        std::fs::write(&delta, b"").unwrap();

        sink.init(1).unwrap();
        sink.send_delta(&delta, "default", PartitionId::new(1, 0)).unwrap();

        let frames = collect_payloads(&mut rx);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            SnapshotFrame::Payload { meta, bytes, last, .. } => {
                assert_eq!(meta.policy, ChunkPolicy::Chunk);
                assert_eq!(meta.count, 0);
                assert!(bytes.is_empty());
                assert!(last);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_sends_end_or_error() {
        let cluster = LocalCluster::new();
        let (sink, mut rx) = sink_to(&cluster, 1024);
        sink.init(0).unwrap();
        sink.close(None).unwrap();

        let frames = collect_payloads(&mut rx);
        assert!(matches!(frames.last(), Some(SnapshotFrame::End { .. })));

        let (sink2, mut rx2) = sink_to(&cluster, 1024);
        sink2.init(0).unwrap();
        sink2.close(Some(&SnapshotError::Cancelled)).unwrap();
        let frames2 = collect_payloads(&mut rx2);
        assert!(matches!(frames2.last(), Some(SnapshotFrame::Error { .. })));
    }

    #[tokio::test]
    async fn test_poisoned_sink_stops_streaming() {
        let cluster = LocalCluster::new();
        let poison = Poison::new();
        let (sender_node, _tx_rx) = cluster.join();
        let (receiver_node, mut rx) = cluster.join();
        let sink = RemoteSink::new(
            sender_node,
            receiver_node.local_node(),
            Uuid::new_v4(),
            "rmt-1",
            "db/node-a".to_string(),
            1024,
            poison.clone(),
        );

        sink.init(1).unwrap();
        poison.poison(SnapshotError::TransferCancelled);

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("part-0.bin");
        std::fs::write(&file, vec![0u8; 2048]).unwrap();

        assert_eq!(
            sink.send_part(&file, "default", PartitionId::new(1, 0), 2048).unwrap_err(),
            SnapshotError::TransferCancelled
        );
        assert!(collect_payloads(&mut rx).is_empty());
    }
}
