//! Remote snapshot receiver
//!
//! Reconstructs partition stores from an inbound transmission: `File`
//! chunks assemble the clean partition copy, the paired `Chunk` stream
//! replays delta pages through the recover bracket, and the partition is
//! handed to the consumer only after `finish_recover` validated every
//! page CRC.
//!
//! Every frame is checked against the active request identity; a frame
//! for a superseded or cancelled request raises `TransferCancelled`,
//! which the transport layer treats as a clean abort.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ChunkPolicy, SnapshotFrame, TransmissionMeta};
use crate::cluster::NodeId;
use crate::errors::{SnapshotError, SnapshotResult};
use crate::layout::partition_file_name;
use crate::page::{read_page_id, PartitionId};
use crate::pagestore::PartitionPageStore;

/// Callback invoked with every reconstructed partition file.
pub type PartConsumer = Arc<dyn Fn(PartitionId, &Path) + Send + Sync>;

enum PartPhase {
    /// Clean copy is being assembled
    Assembling { file: File, received: u64 },
    /// Delta pages are being replayed
    Recovering { store: PartitionPageStore, received: u64, carry: Vec<u8> },
}

struct PartState {
    path: PathBuf,
    phase: PartPhase,
}

struct RequestState {
    parts: HashMap<PartitionId, PartState>,
    parts_left: i32,
    total_known: bool,
    done: Option<oneshot::Sender<SnapshotResult<()>>>,
}

/// One in-flight remote snapshot request on the requesting node.
pub struct RemoteRequestHandle {
    request_id: Uuid,
    remote_node: NodeId,
    name: String,
    dir: PathBuf,
    page_size: usize,
    consumer: PartConsumer,
    cancelled: AtomicBool,
    responded: AtomicBool,
    state: Mutex<RequestState>,
}

impl RemoteRequestHandle {
    /// Request identity.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Node serving this request.
    pub fn remote_node(&self) -> NodeId {
        self.remote_node
    }

    /// Snapshot name of the transmission.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the serving node acknowledged the request.
    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Record the serving node's acknowledgment.
    pub fn mark_responded(&self) {
        self.responded.store(true, Ordering::Release);
    }

    fn complete(&self, result: SnapshotResult<()>) {
        let sender = self.state.lock().expect("request lock poisoned").done.take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    fn drop_data(&self) {
        let mut state = self.state.lock().expect("request lock poisoned");
        state.parts.clear();
        drop(state);
        if self.dir.exists() {
            if let Err(err) = fs::remove_dir_all(&self.dir) {
                warn!(dir = %self.dir.display(), %err, "failed to drop received data");
            }
        }
    }

    fn check_active(&self, meta: &TransmissionMeta) -> SnapshotResult<()> {
        if self.cancelled.load(Ordering::Acquire) || meta.request_id != self.request_id {
            return Err(SnapshotError::TransferCancelled);
        }
        Ok(())
    }

    fn part_path(&self, meta: &TransmissionMeta) -> PathBuf {
        self.dir.join(&meta.cache_dir).join(partition_file_name(meta.partition()))
    }

    /// Handle one payload frame of the clean-copy stream.
    fn on_file_bytes(&self, meta: &TransmissionMeta, bytes: &[u8], last: bool) -> SnapshotResult<()> {
        self.check_active(meta)?;
        let partition = meta.partition();
        let path = self.part_path(meta);

        let mut state = self.state.lock().expect("request lock poisoned");
        if !state.total_known {
            state.parts_left = meta.total_parts as i32;
            state.total_known = true;
        }

        let part = match state.parts.entry(partition) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| SnapshotError::transfer(parent.display(), e))?;
                }
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| SnapshotError::transfer(path.display(), e))?;
                entry.insert(PartState {
                    path: path.clone(),
                    phase: PartPhase::Assembling { file, received: 0 },
                })
            }
        };

        let PartPhase::Assembling { file, received } = &mut part.phase else {
            return Err(SnapshotError::TransferFailed(format!(
                "file chunk for {} arrived after its delta began",
                partition
            )));
        };

        file.write_all(bytes).map_err(|e| SnapshotError::transfer(path.display(), e))?;
        *received += bytes.len() as u64;

        if last {
            if *received != meta.count {
                return Err(SnapshotError::TransferFailed(format!(
                    "{}: received {} bytes, expected {}",
                    partition, received, meta.count
                )));
            }
            file.sync_all().map_err(|e| SnapshotError::transfer(path.display(), e))?;

            // The clean copy is in place; open it as a page store and
            // enter the recover bracket for the delta that follows.
            let mut store = PartitionPageStore::open(&path, partition, self.page_size)?;
            store.begin_recover();
            part.phase = PartPhase::Recovering { store, received: 0, carry: Vec::new() };
            debug!(%partition, bytes = meta.count, "partition file received");
        }

        Ok(())
    }

    /// Handle one payload frame of the delta stream.
    fn on_chunk_bytes(
        &self,
        meta: &TransmissionMeta,
        bytes: &[u8],
        last: bool,
    ) -> SnapshotResult<()> {
        self.check_active(meta)?;
        let partition = meta.partition();

        let mut state = self.state.lock().expect("request lock poisoned");

        let finalize = {
            let part = state.parts.get_mut(&partition).ok_or_else(|| {
                SnapshotError::TransferFailed(format!(
                    "delta chunk for {} without a prior file",
                    partition
                ))
            })?;

            let PartPhase::Recovering { store, received, carry } = &mut part.phase else {
                return Err(SnapshotError::TransferFailed(format!(
                    "delta chunk for {} before its file completed",
                    partition
                )));
            };

            carry.extend_from_slice(bytes);
            *received += bytes.len() as u64;

            let page_size = store.page_size();
            let mut offset = 0;
            while carry.len() - offset >= page_size {
                let mut page = carry[offset..offset + page_size].to_vec();
                store.write(read_page_id(&page), &mut page)?;
                offset += page_size;
            }
            carry.drain(..offset);

            if *received > meta.count {
                return Err(SnapshotError::TransferFailed(format!(
                    "{}: delta overran its declared {} bytes",
                    partition, meta.count
                )));
            }

            let complete = *received == meta.count && last;
            if complete && !carry.is_empty() {
                return Err(SnapshotError::TransferFailed(format!(
                    "{}: delta ended on a partial page",
                    partition
                )));
            }
            complete
        };

        if finalize {
            let mut part = state.parts.remove(&partition).expect("part state present");
            let PartPhase::Recovering { store, .. } = &mut part.phase else {
                unreachable!("checked above");
            };
            store.finish_recover()?;
            state.parts_left -= 1;
            let parts_left = state.parts_left;
            drop(state);

            debug!(%partition, delta_bytes = meta.count, parts_left, "partition reconstructed");
            (self.consumer)(partition, &part.path);
        }

        Ok(())
    }

    /// Handle the end-of-transmission marker.
    fn on_end(&self, request_id: Uuid) -> SnapshotResult<()> {
        if self.cancelled.load(Ordering::Acquire) || request_id != self.request_id {
            return Err(SnapshotError::TransferCancelled);
        }

        let state = self.state.lock().expect("request lock poisoned");
        if !state.parts.is_empty() || state.parts_left != 0 {
            return Err(SnapshotError::TransferFailed(format!(
                "transmission ended early: {} partitions open, {} pending",
                state.parts.len(),
                state.parts_left
            )));
        }
        drop(state);

        info!(name = %self.name, from = %self.remote_node, "remote snapshot received");
        self.complete(Ok(()));
        Ok(())
    }

    /// Propagate a sender-side failure.
    fn on_exception(&self, err: SnapshotError) {
        self.drop_data();
        self.complete(Err(err));
    }
}

/// Requester-side registry of in-flight remote snapshots, at most one
/// per serving node.
pub struct RemoteReceiverRegistry {
    work_dir: PathBuf,
    page_size: usize,
    active: Mutex<HashMap<NodeId, Arc<RemoteRequestHandle>>>,
}

impl RemoteReceiverRegistry {
    /// Registry writing received files under `work_dir`.
    pub fn new(work_dir: PathBuf, page_size: usize) -> Self {
        Self { work_dir, page_size, active: Mutex::new(HashMap::new()) }
    }

    /// Register a new request to `remote_node`.
    ///
    /// A still-pending prior request to the same node is superseded: its
    /// future completes with `TransferCancelled` and its data is
    /// dropped.
    pub fn register(
        &self,
        remote_node: NodeId,
        request_id: Uuid,
        name: &str,
        consumer: PartConsumer,
    ) -> (Arc<RemoteRequestHandle>, oneshot::Receiver<SnapshotResult<()>>) {
        let (done_tx, done_rx) = oneshot::channel();

        let handle = Arc::new(RemoteRequestHandle {
            request_id,
            remote_node,
            name: name.to_string(),
            dir: self.work_dir.join(name),
            page_size: self.page_size,
            consumer,
            cancelled: AtomicBool::new(false),
            responded: AtomicBool::new(false),
            state: Mutex::new(RequestState {
                parts: HashMap::new(),
                parts_left: 0,
                total_known: false,
                done: Some(done_tx),
            }),
        });

        let prior = self
            .active
            .lock()
            .expect("registry lock poisoned")
            .insert(remote_node, Arc::clone(&handle));

        if let Some(prior) = prior {
            info!(
                from = %remote_node,
                superseded = %prior.name,
                by = %handle.name,
                "remote snapshot request superseded"
            );
            prior.cancelled.store(true, Ordering::Release);
            prior.on_exception(SnapshotError::TransferCancelled);
        }

        (handle, done_rx)
    }

    /// The active request for a serving node, if any.
    pub fn active(&self, remote_node: NodeId) -> Option<Arc<RemoteRequestHandle>> {
        self.active.lock().expect("registry lock poisoned").get(&remote_node).cloned()
    }

    /// Handle one inbound frame from `from`.
    pub fn handle_frame(&self, from: NodeId, frame: SnapshotFrame) {
        let Some(handle) = self.active(from) else {
            debug!(from = %from, "frame for no active request dropped");
            return;
        };

        let result = match &frame {
            SnapshotFrame::Payload { meta, bytes, last, .. } => match meta.policy {
                ChunkPolicy::File => handle.on_file_bytes(meta, bytes, *last),
                ChunkPolicy::Chunk => handle.on_chunk_bytes(meta, bytes, *last),
            },
            SnapshotFrame::End { request_id } => handle.on_end(*request_id),
            SnapshotFrame::Error { request_id, message } => {
                if *request_id == handle.request_id() {
                    handle.on_exception(SnapshotError::TransferFailed(message.clone()));
                    self.remove(from, handle.request_id());
                }
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                if matches!(frame, SnapshotFrame::End { .. }) {
                    self.remove(from, handle.request_id());
                }
            }
            Err(SnapshotError::TransferCancelled) => {
                // Clean abort: a superseded request's frames are drained
                // without effect.
                debug!(from = %from, "frame for superseded request ignored");
            }
            Err(err) => {
                warn!(from = %from, %err, "remote snapshot reception failed");
                handle.on_exception(err);
                self.remove(from, handle.request_id());
            }
        }
    }

    /// Handle the serving node's response message.
    pub fn on_response(&self, from: NodeId, request_id: Uuid, error: Option<String>) {
        let Some(handle) = self.active(from) else {
            return;
        };
        if handle.request_id() != request_id {
            return;
        }
        match error {
            None => handle.mark_responded(),
            Some(message) => {
                handle.on_exception(SnapshotError::TransferFailed(message));
                self.remove(from, request_id);
            }
        }
    }

    /// Cancel the active request to `remote_node`, if it is `request_id`.
    pub fn cancel(&self, remote_node: NodeId, request_id: Uuid, err: SnapshotError) {
        let Some(handle) = self.active(remote_node) else {
            return;
        };
        if handle.request_id() != request_id {
            return;
        }
        handle.cancelled.store(true, Ordering::Release);
        handle.on_exception(err);
        self.remove(remote_node, request_id);
    }

    /// Fail every request served by a departed node.
    pub fn on_node_left(&self, node: NodeId) {
        let Some(handle) = self.active(node) else {
            return;
        };
        handle.cancelled.store(true, Ordering::Release);
        handle.on_exception(SnapshotError::TopologyChanged(format!("{} has left", node)));
        self.remove(node, handle.request_id());
    }

    fn remove(&self, node: NodeId, request_id: Uuid) {
        let mut active = self.active.lock().expect("registry lock poisoned");
        if let Some(current) = active.get(&node) {
            if current.request_id() == request_id {
                active.remove(&node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{stamp_page_crc, write_page_id, PageId, DEFAULT_PAGE_SIZE, PAGE_HEADER_SIZE};
    use tempfile::TempDir;

    const PS: usize = DEFAULT_PAGE_SIZE;

    fn page(partition_id: i32, index: u32, fill: u8) -> Vec<u8> {
        let mut buf = vec![0u8; PS];
        for b in buf.iter_mut().skip(PAGE_HEADER_SIZE) {
            *b = fill;
        }
        write_page_id(&mut buf, PageId::new(partition_id, index));
        stamp_page_crc(&mut buf);
        buf
    }

    fn meta(
        request_id: Uuid,
        partition_id: i32,
        policy: ChunkPolicy,
        count: u64,
        total_parts: u32,
    ) -> TransmissionMeta {
        TransmissionMeta {
            request_id,
            snapshot_name: "rmt-1".to_string(),
            group_id: 1,
            partition_id,
            cache_dir: "default".to_string(),
            node_path: "db/node-b".to_string(),
            total_parts,
            count,
            policy,
        }
    }

    struct Fixture {
        _dir: TempDir,
        registry: RemoteReceiverRegistry,
        serving: NodeId,
        received: Arc<Mutex<Vec<(PartitionId, PathBuf)>>>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = RemoteReceiverRegistry::new(dir.path().join("rmt"), PS);
        let received = Arc::new(Mutex::new(Vec::new()));
        Fixture { _dir: dir, registry, serving: NodeId::random(), received }
    }

    fn consumer_of(fx: &Fixture) -> PartConsumer {
        let received = Arc::clone(&fx.received);
        Arc::new(move |pid, path: &Path| {
            received.lock().unwrap().push((pid, path.to_path_buf()));
        })
    }

    #[tokio::test]
    async fn test_file_then_empty_delta_reconstructs() {
        let fx = fixture();
        let request_id = Uuid::new_v4();
        let consumer = consumer_of(&fx);
        let (_handle, done) = fx.registry.register(fx.serving, request_id, "rmt-1", consumer);

        let body = page(0, 0, 0x42);
        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: meta(request_id, 0, ChunkPolicy::File, PS as u64, 1),
                offset: 0,
                bytes: body.clone(),
                last: true,
            },
        );
        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: meta(request_id, 0, ChunkPolicy::Chunk, 0, 1),
                offset: 0,
                bytes: Vec::new(),
                last: true,
            },
        );
        fx.registry.handle_frame(fx.serving, SnapshotFrame::End { request_id });

        done.await.unwrap().unwrap();

        let received = fx.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, PartitionId::new(1, 0));
        assert_eq!(std::fs::read(&received[0].1).unwrap(), body);
        assert!(fx.registry.active(fx.serving).is_none());
    }

    #[tokio::test]
    async fn test_delta_pages_overwrite_copy() {
        let fx = fixture();
        let request_id = Uuid::new_v4();
        let consumer = consumer_of(&fx);
        let (_handle, done) = fx.registry.register(fx.serving, request_id, "rmt-1", consumer);

        // Clean copy carries the newer, post-boundary content.
        let newer = page(0, 0, 0xEE);
        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: meta(request_id, 0, ChunkPolicy::File, PS as u64, 1),
                offset: 0,
                bytes: newer,
                last: true,
            },
        );

        // The delta restores the boundary pre-image, split across frames.
        let boundary = page(0, 0, 0x11);
        let (first_half, second_half) = boundary.split_at(PS / 2);
        let delta_meta = meta(request_id, 0, ChunkPolicy::Chunk, PS as u64, 1);
        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: delta_meta.clone(),
                offset: 0,
                bytes: first_half.to_vec(),
                last: false,
            },
        );
        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: delta_meta,
                offset: (PS / 2) as u64,
                bytes: second_half.to_vec(),
                last: true,
            },
        );
        fx.registry.handle_frame(fx.serving, SnapshotFrame::End { request_id });

        done.await.unwrap().unwrap();
        let received = fx.received.lock().unwrap();
        assert_eq!(std::fs::read(&received[0].1).unwrap(), boundary);
    }

    #[tokio::test]
    async fn test_supersede_cancels_prior() {
        let fx = fixture();
        let consumer = consumer_of(&fx);
        let first_id = Uuid::new_v4();
        let (_first, first_done) =
            fx.registry.register(fx.serving, first_id, "rmt-1", Arc::clone(&consumer));

        let second_id = Uuid::new_v4();
        let (_second, _second_done) =
            fx.registry.register(fx.serving, second_id, "rmt-2", consumer);

        assert_eq!(first_done.await.unwrap().unwrap_err(), SnapshotError::TransferCancelled);

        // Frames of the superseded request are drained without effect.
        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: meta(first_id, 0, ChunkPolicy::File, PS as u64, 1),
                offset: 0,
                bytes: page(0, 0, 0x01),
                last: true,
            },
        );
        let active = fx.registry.active(fx.serving).unwrap();
        assert_eq!(active.request_id(), second_id);
    }

    #[tokio::test]
    async fn test_error_frame_fails_request_and_drops_data() {
        let fx = fixture();
        let request_id = Uuid::new_v4();
        let consumer = consumer_of(&fx);
        let (_handle, done) = fx.registry.register(fx.serving, request_id, "rmt-1", consumer);

        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: meta(request_id, 0, ChunkPolicy::File, 2 * PS as u64, 1),
                offset: 0,
                bytes: page(0, 0, 0x01),
                last: false,
            },
        );
        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Error { request_id, message: "disk on fire".to_string() },
        );

        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, SnapshotError::TransferFailed(_)));
        assert!(!fx._dir.path().join("rmt").join("rmt-1").exists());
    }

    #[tokio::test]
    async fn test_corrupt_delta_page_fails_partition() {
        let fx = fixture();
        let request_id = Uuid::new_v4();
        let consumer = consumer_of(&fx);
        let (_handle, done) = fx.registry.register(fx.serving, request_id, "rmt-1", consumer);

        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: meta(request_id, 0, ChunkPolicy::File, PS as u64, 1),
                offset: 0,
                bytes: page(0, 0, 0x42),
                last: true,
            },
        );

        let mut corrupt = page(0, 0, 0x13);
        corrupt[1] ^= 0xFF; // break the CRC
        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: meta(request_id, 0, ChunkPolicy::Chunk, PS as u64, 1),
                offset: 0,
                bytes: corrupt,
                last: true,
            },
        );

        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidPage(_)));
        assert!(fx.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_with_open_parts_fails() {
        let fx = fixture();
        let request_id = Uuid::new_v4();
        let consumer = consumer_of(&fx);
        let (_handle, done) = fx.registry.register(fx.serving, request_id, "rmt-1", consumer);

        fx.registry.handle_frame(
            fx.serving,
            SnapshotFrame::Payload {
                meta: meta(request_id, 0, ChunkPolicy::File, PS as u64, 2),
                offset: 0,
                bytes: page(0, 0, 0x42),
                last: true,
            },
        );
        fx.registry.handle_frame(fx.serving, SnapshotFrame::End { request_id });

        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, SnapshotError::TransferFailed(_)));
    }

    #[tokio::test]
    async fn test_node_leave_fails_request() {
        let fx = fixture();
        let request_id = Uuid::new_v4();
        let consumer = consumer_of(&fx);
        let (_handle, done) = fx.registry.register(fx.serving, request_id, "rmt-1", consumer);

        fx.registry.on_node_left(fx.serving);

        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, SnapshotError::TopologyChanged(_)));
        assert!(fx.registry.active(fx.serving).is_none());
    }
}
