//! File-backed cache engine
//!
//! A minimal cache processor for embedding and tests: page writes land in
//! an in-memory dirty table and reach the partition files only when a
//! checkpoint flushes them. The flush hands each page's on-disk pre-image
//! to the live delta interceptor under the partition lock before
//! overwriting it, which is the copy-on-write contract the snapshot
//! engine relies on.
//!
//! Live data layout: `<root>/db/<nodeFolder>/<groupName>/part-<N>.bin`
//! plus `index.bin` and one `<cache>.conf` per cache.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::{
    CacheEngine, CheckpointContext, CheckpointHandle, CheckpointListener, GroupDescriptor,
};
use crate::errors::{SnapshotError, SnapshotResult};
use crate::layout::partition_file_name;
use crate::page::{PageId, PartitionId, PAGE_HEADER_SIZE};
use crate::pagestore::PartitionPageStore;

struct GroupState {
    descriptor: GroupDescriptor,
    dir: PathBuf,
    stores: BTreeMap<i32, Arc<Mutex<PartitionPageStore>>>,
}

struct Inner {
    node_folder: String,
    page_size: usize,
    db_dir: PathBuf,
    groups: RwLock<BTreeMap<i32, GroupState>>,
    checkpoint_lock: RwLock<()>,
    checkpoint_serial: Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn CheckpointListener>>>,
    interceptors: RwLock<HashMap<PartitionId, Vec<Arc<crate::delta::DeltaWriter>>>>,
    dirty: Mutex<BTreeMap<(PartitionId, u32), Vec<u8>>>,
    binary_types: Mutex<BTreeMap<String, i32>>,
    mappings: Mutex<BTreeMap<String, String>>,
    wal_flushes: AtomicU64,
}

/// File-backed implementation of [`CacheEngine`].
pub struct LocalCacheEngine {
    inner: Arc<Inner>,
}

impl LocalCacheEngine {
    /// Create an engine rooted at `root`, owning
    /// `<root>/db/<node_folder>`.
    pub fn new(root: &std::path::Path, node_folder: &str, page_size: usize) -> SnapshotResult<Self> {
        let db_dir = root.join("db").join(node_folder);
        std::fs::create_dir_all(&db_dir)
            .map_err(|e| SnapshotError::storage(db_dir.display(), e))?;

        Ok(Self {
            inner: Arc::new(Inner {
                node_folder: node_folder.to_string(),
                page_size,
                db_dir,
                groups: RwLock::new(BTreeMap::new()),
                checkpoint_lock: RwLock::new(()),
                checkpoint_serial: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                interceptors: RwLock::new(HashMap::new()),
                dirty: Mutex::new(BTreeMap::new()),
                binary_types: Mutex::new(BTreeMap::new()),
                mappings: Mutex::new(BTreeMap::new()),
                wal_flushes: AtomicU64::new(0),
            }),
        })
    }

    /// Create a cache group with `partitions` data partitions and an
    /// index partition, plus one config file per cache.
    pub fn create_group(
        &self,
        group_id: i32,
        name: &str,
        caches: &[&str],
        partitions: u32,
    ) -> SnapshotResult<()> {
        let dir = self.inner.db_dir.join(name);
        std::fs::create_dir_all(&dir).map_err(|e| SnapshotError::storage(dir.display(), e))?;

        let mut stores = BTreeMap::new();
        for part in 0..partitions as i32 {
            let pid = PartitionId::new(group_id, part);
            let path = dir.join(partition_file_name(pid));
            stores.insert(
                part,
                Arc::new(Mutex::new(PartitionPageStore::create(
                    &path,
                    pid,
                    self.inner.page_size,
                )?)),
            );
        }
        let index = PartitionId::index(group_id);
        let index_path = dir.join(partition_file_name(index));
        stores.insert(
            index.partition_id,
            Arc::new(Mutex::new(PartitionPageStore::create(
                &index_path,
                index,
                self.inner.page_size,
            )?)),
        );

        for cache in caches {
            let cfg = json!({
                "cache": cache,
                "group": name,
                "group_id": group_id,
                "mode": "PARTITIONED",
                "backups": 1,
            });
            let path = dir.join(format!("{}.conf", cache));
            std::fs::write(&path, serde_json::to_vec_pretty(&cfg).expect("static json"))
                .map_err(|e| SnapshotError::storage(path.display(), e))?;
        }

        let descriptor = GroupDescriptor {
            group_id,
            name: name.to_string(),
            caches: caches.iter().map(|c| c.to_string()).collect(),
        };

        let mut groups = self.inner.groups.write().expect("groups lock poisoned");
        groups.insert(group_id, GroupState { descriptor, dir, stores });

        debug!(group = group_id, name, partitions, "cache group created");
        Ok(())
    }

    /// Destroy a cache group and delete its files.
    ///
    /// Runs under the checkpoint read lock so it cannot interleave with a
    /// checkpoint boundary.
    pub fn destroy_group(&self, group_id: i32) -> SnapshotResult<()> {
        let _cp = self.inner.checkpoint_lock.read().expect("checkpoint lock poisoned");

        let removed = {
            let mut groups = self.inner.groups.write().expect("groups lock poisoned");
            groups.remove(&group_id)
        };

        let Some(state) = removed else {
            return Ok(());
        };

        self.inner
            .dirty
            .lock()
            .expect("dirty lock poisoned")
            .retain(|(pid, _), _| pid.group_id != group_id);

        std::fs::remove_dir_all(&state.dir)
            .map_err(|e| SnapshotError::storage(state.dir.display(), e))?;

        debug!(group = group_id, "cache group destroyed");
        Ok(())
    }

    /// Register a binary type.
    pub fn register_type(&self, name: &str, type_id: i32) {
        self.inner
            .binary_types
            .lock()
            .expect("types lock poisoned")
            .insert(name.to_string(), type_id);
    }

    /// Register a marshaller class mapping.
    pub fn register_mapping(&self, from: &str, to: &str) {
        self.inner
            .mappings
            .lock()
            .expect("mappings lock poisoned")
            .insert(from.to_string(), to.to_string());
    }

    /// Stage a page write; it reaches disk at the next checkpoint.
    ///
    /// `payload` is the page body after the page header.
    pub fn put_page(
        &self,
        partition: PartitionId,
        page_index: u32,
        payload: &[u8],
    ) -> SnapshotResult<()> {
        if payload.len() > self.inner.page_size - PAGE_HEADER_SIZE {
            return Err(SnapshotError::StorageFailed(format!(
                "payload of {} bytes does not fit a {} byte page",
                payload.len(),
                self.inner.page_size
            )));
        }

        // Writers hold the read side: a checkpoint boundary (write side)
        // sees a stable dirty table.
        let _cp = self.inner.checkpoint_lock.read().expect("checkpoint lock poisoned");

        {
            let groups = self.inner.groups.read().expect("groups lock poisoned");
            let group = groups
                .get(&partition.group_id)
                .ok_or(SnapshotError::CacheGroupStopped(partition.group_id))?;
            if !group.stores.contains_key(&partition.partition_id) {
                return Err(SnapshotError::StorageFailed(format!(
                    "unknown partition {}",
                    partition
                )));
            }
        }

        let mut page = vec![0u8; self.inner.page_size];
        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        crate::page::write_page_id(&mut page, PageId::new(partition.partition_id, page_index));

        self.inner
            .dirty
            .lock()
            .expect("dirty lock poisoned")
            .insert((partition, page_index), page);

        Ok(())
    }

    /// Read a page, preferring the dirty table over the store.
    pub fn read_page(&self, partition: PartitionId, page_index: u32) -> SnapshotResult<Vec<u8>> {
        if let Some(page) = self
            .inner
            .dirty
            .lock()
            .expect("dirty lock poisoned")
            .get(&(partition, page_index))
        {
            return Ok(page.clone());
        }

        let store = self.store(partition)?;
        let mut guard = store.lock().expect("store lock poisoned");
        let mut buf = vec![0u8; self.inner.page_size];
        guard.read(page_index, &mut buf)?;
        Ok(buf)
    }

    /// Number of WAL flushes requested so far.
    pub fn wal_flushes(&self) -> u64 {
        self.inner.wal_flushes.load(Ordering::Relaxed)
    }

    fn store(&self, partition: PartitionId) -> SnapshotResult<Arc<Mutex<PartitionPageStore>>> {
        let groups = self.inner.groups.read().expect("groups lock poisoned");
        let group = groups
            .get(&partition.group_id)
            .ok_or(SnapshotError::CacheGroupStopped(partition.group_id))?;
        group
            .stores
            .get(&partition.partition_id)
            .cloned()
            .ok_or_else(|| SnapshotError::StorageFailed(format!("unknown partition {}", partition)))
    }

    fn run_checkpoint(inner: &Arc<Inner>, reason: String, finished_tx: watch::Sender<bool>) {
        let _serial = inner.checkpoint_serial.lock().expect("checkpoint serial poisoned");

        // Boundary: freeze the dirty table under the write side of the
        // checkpoint lock. Later page writes land in the fresh table and
        // belong to the next checkpoint.
        let (dirty, listeners, cx) = {
            let _wl = inner.checkpoint_lock.write().expect("checkpoint lock poisoned");

            let dirty = std::mem::take(&mut *inner.dirty.lock().expect("dirty lock poisoned"));
            let listeners: Vec<_> =
                inner.listeners.lock().expect("listeners lock poisoned").drain(..).collect();

            let mut boundary: HashMap<PartitionId, u32> = HashMap::new();
            {
                let groups = inner.groups.read().expect("groups lock poisoned");
                for group in groups.values() {
                    for (part, store) in &group.stores {
                        let pages = store.lock().expect("store lock poisoned").pages();
                        boundary
                            .insert(PartitionId::new(group.descriptor.group_id, *part), pages);
                    }
                }
            }
            for ((pid, idx), _) in &dirty {
                let entry = boundary.entry(*pid).or_insert(0);
                *entry = (*entry).max(idx + 1);
            }

            let cx = CheckpointContext::new(boundary, finished_tx.subscribe());
            (dirty, listeners, cx)
        };

        // Listeners run on the checkpoint thread against the frozen cut,
        // outside the boundary lock: they may take its read side (marker
        // writes) without deadlocking. The serial mutex keeps any next
        // boundary out until this checkpoint completes.
        for listener in &listeners {
            listener.on_checkpoint_begin(&cx);
        }
        drop(listeners);

        debug!(reason, pages = dirty.len(), "checkpoint flush started");

        // Flush outside the boundary lock. The partition store mutex is
        // the page write lock: the pre-image is read and handed to the
        // interceptor before the new page is persisted.
        let mut scratch = vec![0u8; inner.page_size];
        let mut touched: Vec<Arc<Mutex<PartitionPageStore>>> = Vec::new();

        for ((pid, idx), mut page) in dirty {
            let store = {
                let groups = inner.groups.read().expect("groups lock poisoned");
                groups
                    .get(&pid.group_id)
                    .and_then(|g| g.stores.get(&pid.partition_id))
                    .cloned()
            };
            let Some(store) = store else {
                warn!(partition = %pid, "dirty page dropped: group stopped mid-checkpoint");
                continue;
            };

            let mut guard = store.lock().expect("store lock poisoned");
            let interceptors = inner
                .interceptors
                .read()
                .expect("interceptors lock poisoned")
                .get(&pid)
                .cloned()
                .unwrap_or_default();
            if !interceptors.is_empty() && idx < guard.pages() {
                if let Err(err) = guard.read(idx, &mut scratch) {
                    error!(partition = %pid, page = idx, %err, "pre-image read failed");
                } else {
                    for interceptor in &interceptors {
                        if let Err(err) = interceptor
                            .on_page_write(PageId::new(pid.partition_id, idx), &scratch)
                        {
                            // The failure is also remembered by the writer
                            // and surfaces when its task closes the delta.
                            warn!(partition = %pid, page = idx, %err, "pre-image capture failed");
                        }
                    }
                }
            }

            if let Err(err) = guard.write(PageId::new(pid.partition_id, idx), &mut page) {
                error!(partition = %pid, page = idx, %err, "checkpoint page write failed");
                continue;
            }
            drop(guard);
            touched.push(store);
        }

        for store in touched {
            if let Err(err) = store.lock().expect("store lock poisoned").sync() {
                error!(%err, "checkpoint fsync failed");
            }
        }

        // Staged interceptors go live only now: the flush above wrote the
        // boundary state itself and must not be captured. A writer whose
        // task already aborted is closed and stays out of the map.
        for (pid, writer) in cx.take_staged() {
            if writer.is_closed() {
                continue;
            }
            inner
                .interceptors
                .write()
                .expect("interceptors lock poisoned")
                .entry(pid)
                .or_default()
                .push(writer);
        }

        let _ = finished_tx.send(true);
        debug!(reason, "checkpoint finished");
    }
}

impl CacheEngine for LocalCacheEngine {
    fn page_size(&self) -> usize {
        self.inner.page_size
    }

    fn node_folder(&self) -> String {
        self.inner.node_folder.clone()
    }

    fn groups(&self) -> Vec<GroupDescriptor> {
        let groups = self.inner.groups.read().expect("groups lock poisoned");
        groups.values().map(|g| g.descriptor.clone()).collect()
    }

    fn group(&self, group_id: i32) -> Option<GroupDescriptor> {
        let groups = self.inner.groups.read().expect("groups lock poisoned");
        groups.get(&group_id).map(|g| g.descriptor.clone())
    }

    fn partitions(&self, group_id: i32) -> SnapshotResult<Vec<i32>> {
        let groups = self.inner.groups.read().expect("groups lock poisoned");
        let group = groups
            .get(&group_id)
            .ok_or(SnapshotError::CacheGroupStopped(group_id))?;
        Ok(group
            .stores
            .keys()
            .copied()
            .filter(|part| *part != crate::page::INDEX_PARTITION)
            .collect())
    }

    fn partition_file(&self, partition: PartitionId) -> SnapshotResult<PathBuf> {
        let groups = self.inner.groups.read().expect("groups lock poisoned");
        let group = groups
            .get(&partition.group_id)
            .ok_or(SnapshotError::CacheGroupStopped(partition.group_id))?;
        if !group.stores.contains_key(&partition.partition_id) {
            return Err(SnapshotError::StorageFailed(format!(
                "unknown partition {}",
                partition
            )));
        }
        Ok(group.dir.join(partition_file_name(partition)))
    }

    fn cache_config_files(&self, group_id: i32) -> SnapshotResult<Vec<PathBuf>> {
        let groups = self.inner.groups.read().expect("groups lock poisoned");
        let group = groups
            .get(&group_id)
            .ok_or(SnapshotError::CacheGroupStopped(group_id))?;
        Ok(group
            .descriptor
            .caches
            .iter()
            .map(|cache| group.dir.join(format!("{}.conf", cache)))
            .collect())
    }

    fn type_metadata(&self) -> SnapshotResult<Vec<u8>> {
        let types = self.inner.binary_types.lock().expect("types lock poisoned");
        serde_json::to_vec_pretty(&*types)
            .map_err(|e| SnapshotError::StorageFailed(format!("type metadata: {}", e)))
    }

    fn mapping_metadata(&self) -> SnapshotResult<Vec<u8>> {
        let mappings = self.inner.mappings.lock().expect("mappings lock poisoned");
        serde_json::to_vec_pretty(&*mappings)
            .map_err(|e| SnapshotError::StorageFailed(format!("mapping metadata: {}", e)))
    }

    fn flush_wal(&self) -> SnapshotResult<()> {
        // Page writes live in the dirty table until a checkpoint; there
        // is no log segment to force here.
        self.inner.wal_flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn checkpoint_lock(&self) -> &RwLock<()> {
        &self.inner.checkpoint_lock
    }

    fn schedule_checkpoint_listener(&self, listener: Arc<dyn CheckpointListener>) {
        self.inner.listeners.lock().expect("listeners lock poisoned").push(listener);
    }

    fn remove_page_interceptor(&self, partition: PartitionId, writer: &Arc<crate::delta::DeltaWriter>) {
        let mut interceptors = self.inner.interceptors.write().expect("interceptors lock poisoned");
        if let Some(writers) = interceptors.get_mut(&partition) {
            writers.retain(|w| !Arc::ptr_eq(w, writer));
            if writers.is_empty() {
                interceptors.remove(&partition);
            }
        }
    }

    fn force_checkpoint(&self, reason: &str) -> SnapshotResult<CheckpointHandle> {
        let (finished_tx, finished_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let reason = reason.to_string();

        std::thread::Builder::new()
            .name("checkpoint".to_string())
            .spawn(move || LocalCacheEngine::run_checkpoint(&inner, reason, finished_tx))
            .map_err(|e| SnapshotError::StorageFailed(format!("checkpoint thread: {}", e)))?;

        Ok(CheckpointHandle { finished: finished_rx })
    }
}
