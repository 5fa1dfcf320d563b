//! Wires the WAL, dual-memtable swap, sorted runs, manifest, block cache
//! and compaction worker into the single entry point the document engine
//! talks to: the LSM storage layer.
//!
//! Reads consult, in order: the active memtable, the in-flight immutable
//! memtable (if a flush is pending), then sorted runs newest-to-oldest,
//! short-circuiting on first hit and consulting each run's bloom filter
//! before touching its data region.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::Result;
use crate::storage::cache::{BlockCache, CacheKey};
use crate::storage::compaction::{self, CompactionWorker};
use crate::storage::manifest::{CollectionManifest, Manifest};
use crate::storage::memtable::{Memtable, MemtableValue};
use crate::storage::sorted_run::SortedRun;
use crate::storage::wal::{Durability, Wal, WalOp, WalRecord};

/// Groups a key into the shard (sorted-run family) it belongs to: everything
/// under one database+collection shares one shard so "all
/// documents/indexes/vectors in a collection" is one contiguous run family;
/// everything under `meta:` shares the `meta` shard.
pub fn shard_of(key: &[u8]) -> String {
    let s = String::from_utf8_lossy(key);
    if let Some(rest) = s.strip_prefix("db:") {
        let parts: Vec<&str> = rest.splitn(4, ':').collect();
        if parts.len() >= 3 {
            return format!("db:{}:col:{}", parts[0], parts[2]);
        }
    }
    "meta".to_string()
}

struct ImmutableGeneration {
    memtable: Arc<Memtable>,
    sealed_wal_segment: u64,
}

/// Opened `SortedRun` handles, cached so repeated lookups don't reread
/// footers from disk. Keyed by (shard, run_id).
struct RunTable {
    manifest: Arc<Manifest>,
    handles: DashMap<(String, u64), Arc<SortedRun>>,
    data_dir: std::path::PathBuf,
}

impl RunTable {
    fn open_run(&self, shard: &str, run_id: u64) -> Result<Arc<SortedRun>> {
        if let Some(run) = self.handles.get(&(shard.to_string(), run_id)) {
            return Ok(run.clone());
        }
        let path = SortedRun::path_for(&self.data_dir, shard, run_id);
        let run = Arc::new(SortedRun::open(path, shard, run_id)?);
        self.handles
            .insert((shard.to_string(), run_id), run.clone());
        Ok(run)
    }

    /// Runs for a shard, in manifest order (newest first).
    fn runs_for_shard(&self, shard: &str) -> Result<Vec<Arc<SortedRun>>> {
        let snapshot = self.manifest.load();
        let Some(entry) = snapshot.collections.get(shard) else {
            return Ok(Vec::new());
        };
        entry
            .run_ids
            .iter()
            .map(|&id| self.open_run(shard, id))
            .collect()
    }
}

/// The durable ordered key-value substrate. Owns the WAL,
/// the active/immutable memtable pair, the manifest of sorted runs, the
/// block cache, and the background flush/compaction workers.
///
/// Always held behind an `Arc` (see `open`): the background flush worker
/// needs a handle that outlives the call that created it.
pub struct StorageEngine {
    config: StorageConfig,
    wal: Arc<Wal>,
    active: RwLock<Arc<Memtable>>,
    immutable: RwLock<Option<ImmutableGeneration>>,
    manifest: Arc<Manifest>,
    runs: RunTable,
    cache: BlockCache<Vec<u8>>,
    flush_worker: Mutex<Option<JoinHandle<()>>>,
    flush_shutdown: Arc<AtomicBool>,
    flush_wake: mpsc::Sender<()>,
    compactor: Mutex<Option<CompactionWorker>>,
}

impl StorageEngine {
    /// Opens (or creates) the engine rooted at `config.data_dir`: replays
    /// the WAL into a fresh memtable, loads the manifest, cleans up any
    /// orphaned sorted-run files from a crash mid-compaction, and starts
    /// the background flush and compaction workers.
    pub fn open(config: StorageConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let (wal, recovered) = Wal::open(&config)?;

        let memtable = Arc::new(Memtable::new(config.memtable_size_bytes));
        for record in recovered {
            match record.op {
                WalOp::Put => memtable.put(record.key, record.value),
                WalOp::Delete => memtable.delete(record.key),
            }
        }
        info!(entries = memtable.len(), "recovered memtable from WAL");

        let manifest = Arc::new(Manifest::open(&config.data_dir)?);
        compaction::cleanup_orphan_runs(&config.data_dir, &manifest)?;

        let runs = RunTable {
            manifest: manifest.clone(),
            handles: DashMap::new(),
            data_dir: config.data_dir.clone(),
        };
        let cache = BlockCache::new(config.block_cache_entries);

        let compactor = CompactionWorker::start(
            Arc::from(config.data_dir.as_path()),
            manifest.clone(),
            config.sorted_run_compaction_threshold,
            config.bloom_false_positive_rate,
            Duration::from_secs(5),
        );

        let (flush_wake_tx, flush_wake_rx) = mpsc::channel::<()>();
        let flush_shutdown = Arc::new(AtomicBool::new(false));

        let engine = Arc::new(Self {
            config: config.clone(),
            wal,
            active: RwLock::new(memtable),
            immutable: RwLock::new(None),
            manifest,
            runs,
            cache,
            flush_worker: Mutex::new(None),
            flush_shutdown: flush_shutdown.clone(),
            flush_wake: flush_wake_tx,
            compactor: Mutex::new(Some(compactor)),
        });

        // Cold-start policy: if the recovered memtable already exceeds
        // threshold, flush it before accepting new writes instead of
        // waiting for the background worker's next wakeup.
        if engine.active.read().unwrap().should_flush() {
            engine.swap_memtable()?;
            engine.flush_immutable()?;
        }

        let worker_engine = engine.clone();
        let handle = std::thread::Builder::new()
            .name("nexadb-flusher".to_string())
            .spawn(move || loop {
                match flush_wake_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(()) => {}
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
                if worker_engine.flush_shutdown.load(Ordering::SeqCst) {
                    let _ = worker_engine.flush_immutable();
                    break;
                }
                if let Err(e) = worker_engine.flush_immutable() {
                    tracing::warn!(error = %e, "flush pass failed");
                }
            })
            .expect("failed to spawn flush worker thread");
        *engine.flush_worker.lock().unwrap() = Some(handle);

        Ok(engine)
    }

    /// Reads a key, consulting active memtable, immutable memtable, then
    /// sorted runs newest-to-oldest.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.get(&CacheKey::Logical(key.to_vec())) {
            return Ok(Some(cached));
        }

        if let Some(v) = self.active.read().unwrap().get(key) {
            return Ok(self.visible(key, v));
        }
        if let Some(gen) = self.immutable.read().unwrap().as_ref() {
            if let Some(v) = gen.memtable.get(key) {
                return Ok(self.visible(key, v));
            }
        }

        let shard = shard_of(key);
        for run in self.runs.runs_for_shard(&shard)? {
            if let Some(v) = run.get(key)? {
                return Ok(self.visible(key, v));
            }
        }
        Ok(None)
    }

    fn visible(&self, key: &[u8], v: MemtableValue) -> Option<Vec<u8>> {
        match v {
            MemtableValue::Value(bytes) => {
                self.cache
                    .insert(CacheKey::Logical(key.to_vec()), bytes.clone());
                Some(bytes)
            }
            MemtableValue::Tombstone => None,
        }
    }

    /// Writes a single key durably (WAL then memtable), per the default
    /// configured durability.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, durability: Durability) -> Result<()> {
        self.batch(vec![WalRecord::put(key, value)], durability)
    }

    pub fn delete(&self, key: Vec<u8>, durability: Durability) -> Result<()> {
        self.batch(vec![WalRecord::delete(key)], durability)
    }

    /// Applies a group of records as a single logical write group: the
    /// whole group is appended to the WAL and synced as one unit before
    /// any of them becomes visible in the memtable. Used for a document
    /// write plus its secondary-index maintenance and for `batch_write`,
    /// so that a crash either sees the whole group or none of it.
    pub fn batch(&self, records: Vec<WalRecord>, durability: Durability) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.wal.append_batch(&records, durability)?;

        let active = self.active.read().unwrap().clone();
        for record in records {
            self.cache.invalidate(&CacheKey::Logical(record.key.clone()));
            match record.op {
                WalOp::Put => active.put(record.key, record.value),
                WalOp::Delete => active.delete(record.key),
            }
        }
        drop(active);

        if self.active.read().unwrap().should_flush() {
            self.swap_memtable()?;
        }
        Ok(())
    }

    /// Atomically replaces the active memtable with a fresh one and hands
    /// the former to the immutable slot, sealing the WAL segment it was
    /// backed by. If a flush is
    /// already in flight the swap is skipped; the active memtable is
    /// allowed to grow a little past threshold until the worker catches
    /// up rather than blocking the writer.
    fn swap_memtable(&self) -> Result<()> {
        let mut immutable = self.immutable.write().unwrap();
        if immutable.is_some() {
            return Ok(());
        }
        let sealed_seg = self.wal.roll_segment()?;
        let fresh = Arc::new(Memtable::new(self.config.memtable_size_bytes));
        let old = {
            let mut active = self.active.write().unwrap();
            std::mem::replace(&mut *active, fresh)
        };
        debug!(entries = old.len(), sealed_seg, "swapped memtable, queued for flush");
        *immutable = Some(ImmutableGeneration {
            memtable: old,
            sealed_wal_segment: sealed_seg,
        });
        drop(immutable);
        let _ = self.flush_wake.send(());
        Ok(())
    }

    /// Flushes the immutable memtable (if any) to sorted runs, one per
    /// shard present among its entries, then truncates the WAL segments
    /// it covered. Called by the background flush worker; also callable
    /// directly (tests, cold-start, `shutdown`) to force a synchronous
    /// flush.
    pub fn flush_immutable(&self) -> Result<bool> {
        let generation = {
            let mut immutable = self.immutable.write().unwrap();
            immutable.take()
        };
        let Some(generation) = generation else {
            return Ok(false);
        };

        let snapshot = generation.memtable.snapshot();
        let mut by_shard: HashMap<String, Vec<(Vec<u8>, MemtableValue)>> = HashMap::new();
        for (key, value) in snapshot {
            by_shard.entry(shard_of(&key)).or_default().push((key, value));
        }

        for (shard, mut entries) in by_shard {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let next_run_id = {
                let state = self.manifest.load();
                state
                    .collections
                    .get(&shard)
                    .map(|c| c.next_run_id)
                    .unwrap_or(1)
            };
            let entry_count = entries.len();
            let run = SortedRun::write(
                &self.config.data_dir,
                &shard,
                next_run_id,
                &entries,
                self.config.bloom_false_positive_rate,
            )?;
            self.manifest.update(|state| {
                let entry = state
                    .collections
                    .entry(shard.clone())
                    .or_insert_with(CollectionManifest::default);
                entry.run_ids.insert(0, run.run_id);
                entry.next_run_id = run.run_id + 1;
                entry.flushed_through_segment =
                    entry.flushed_through_segment.max(generation.sealed_wal_segment);
            })?;
            info!(shard = %shard, run_id = run.run_id, entries = entry_count, "flushed memtable to sorted run");
        }

        self.wal.truncate_through(generation.sealed_wal_segment)?;
        Ok(true)
    }

    /// Prefix range scan across active memtable, immutable memtable, and
    /// sorted runs, merged with last-writer-wins semantics, used for
    /// "all documents in a collection" / "all index entries for a field"
    /// scans. The upper bound is exclusive and computed as the
    /// lexicographic successor of `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let end = prefix_upper_bound(prefix);
        let mut merged: std::collections::BTreeMap<Vec<u8>, MemtableValue> =
            std::collections::BTreeMap::new();

        let shard = shard_of(prefix);
        for run in self.runs.runs_for_shard(&shard)?.into_iter().rev() {
            for (key, value) in run.scan()? {
                if key.as_slice() >= prefix && key.as_slice() < end.as_slice() {
                    merged.insert(key, value);
                }
            }
        }
        if let Some(gen) = self.immutable.read().unwrap().as_ref() {
            for (key, value) in gen.memtable.range(prefix, &end) {
                merged.insert(key, value);
            }
        }
        for (key, value) in self.active.read().unwrap().range(prefix, &end) {
            merged.insert(key, value);
        }

        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| match v {
                MemtableValue::Value(bytes) => Some((k, bytes)),
                MemtableValue::Tombstone => None,
            })
            .collect())
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Graceful shutdown: stops the compactor, signals the flush worker
    /// to drain and exit, then does a final synchronous flush so the
    /// method does not return until every in-flight fsync has completed
    /// (design notes §9: "the engine's public close operation must not
    /// return until all workers observe shutdown").
    pub fn shutdown(&self) -> Result<()> {
        if let Some(compactor) = self.compactor.lock().unwrap().take() {
            compactor.shutdown();
        }
        self.flush_shutdown.store(true, Ordering::SeqCst);
        let _ = self.flush_wake.send(());
        if let Some(handle) = self.flush_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.flush_immutable()?;
        self.wal.shutdown();
        Ok(())
    }
}

fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    for i in (0..end.len()).rev() {
        if end[i] != 0xFF {
            end[i] += 1;
            end.truncate(i + 1);
            return end;
        }
    }
    vec![0xFF; prefix.len() + 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            data_dir: dir.to_path_buf(),
            memtable_size_bytes: 1024,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn shard_of_groups_by_database_and_collection() {
        assert_eq!(
            shard_of(b"db:default:col:users:doc:abc"),
            "db:default:col:users"
        );
        assert_eq!(
            shard_of(b"db:default:col:users:idx:age:0000000028:abc"),
            "db:default:col:users"
        );
        assert_eq!(shard_of(b"meta:user:root"), "meta");
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(cfg(dir.path())).unwrap();
        engine
            .put(b"db:default:col:t:doc:1".to_vec(), b"hello".to_vec(), Durability::Sync)
            .unwrap();
        assert_eq!(
            engine.get(b"db:default:col:t:doc:1").unwrap(),
            Some(b"hello".to_vec())
        );
        engine.shutdown().unwrap();
    }

    #[test]
    fn delete_suppresses_value_until_compaction() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(cfg(dir.path())).unwrap();
        let key = b"db:default:col:t:doc:1".to_vec();
        engine.put(key.clone(), b"v".to_vec(), Durability::Sync).unwrap();
        engine.delete(key.clone(), Durability::Sync).unwrap();
        assert_eq!(engine.get(&key).unwrap(), None);
        engine.shutdown().unwrap();
    }

    #[test]
    fn flush_past_threshold_then_reads_from_sorted_run() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(cfg(dir.path())).unwrap();
        for i in 0..50 {
            engine
                .put(
                    format!("db:default:col:t:doc:{i:04}").into_bytes(),
                    vec![0u8; 64],
                    Durability::Grouped,
                )
                .unwrap();
        }
        // Give the background flusher a moment.
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(
            engine.get(b"db:default:col:t:doc:0000").unwrap(),
            Some(vec![0u8; 64])
        );
        engine.shutdown().unwrap();
    }

    #[test]
    fn scan_prefix_merges_memtable_and_runs() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(cfg(dir.path())).unwrap();
        engine
            .put(b"db:default:col:t:doc:a".to_vec(), b"1".to_vec(), Durability::Sync)
            .unwrap();
        engine
            .put(b"db:default:col:t:doc:b".to_vec(), b"2".to_vec(), Durability::Sync)
            .unwrap();
        let scanned = engine.scan_prefix(b"db:default:col:t:doc:").unwrap();
        assert_eq!(scanned.len(), 2);
        engine.shutdown().unwrap();
    }

    #[test]
    fn recovery_after_reopen_preserves_state() {
        let dir = tempdir().unwrap();
        {
            let engine = StorageEngine::open(cfg(dir.path())).unwrap();
            engine
                .put(b"db:default:col:t:doc:1".to_vec(), b"v".to_vec(), Durability::Sync)
                .unwrap();
            engine.shutdown().unwrap();
        }
        let engine = StorageEngine::open(cfg(dir.path())).unwrap();
        assert_eq!(
            engine.get(b"db:default:col:t:doc:1").unwrap(),
            Some(b"v".to_vec())
        );
        engine.shutdown().unwrap();
    }
}
