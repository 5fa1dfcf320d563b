//! Background compaction: bounds read amplification and reclaims space
//! from superseded entries and tombstones.
//!
//! Runs concurrently with reads and writes. A compaction's only visible
//! effect is the manifest swap at the very end; readers holding an older
//! manifest snapshot keep reading the old runs until they start a new
//! operation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::storage::manifest::{CollectionManifest, Manifest};
use crate::storage::memtable::MemtableValue;
use crate::storage::sorted_run::SortedRun;

/// Merges every currently-registered run of `collection` into one,
/// keeping the newest version of each key and dropping tombstones
/// (since, merging *all* runs, no older run outside the merge set could
/// still need one). Returns `true` if a merge happened.
pub fn compact_collection(
    data_dir: &Path,
    manifest: &Manifest,
    collection: &str,
    bloom_fp_rate: f64,
) -> Result<bool> {
    let snapshot = manifest.load();
    let entry = match snapshot.collections.get(collection) {
        Some(e) if e.run_ids.len() >= 2 => e.clone(),
        _ => return Ok(false),
    };

    // run_ids are newest-first; open oldest-to-newest so later merge
    // writes overwrite earlier ones in our scratch map, matching
    // "newest version wins".
    let mut runs = Vec::new();
    for &run_id in entry.run_ids.iter().rev() {
        let path = SortedRun::path_for(data_dir, collection, run_id);
        runs.push(SortedRun::open(path, collection, run_id)?);
    }

    let mut merged: BTreeMap<Vec<u8>, MemtableValue> = BTreeMap::new();
    for run in &runs {
        for (key, value) in run.scan()? {
            merged.insert(key, value);
        }
    }

    let live_entries: Vec<(Vec<u8>, MemtableValue)> = merged
        .into_iter()
        .filter(|(_, v)| !matches!(v, MemtableValue::Tombstone))
        .collect();

    if live_entries.is_empty() {
        // Everything compacted away to nothing: install an empty
        // collection manifest entry with no runs instead of writing a
        // run file with zero entries (which `SortedRun::write` rejects).
        let old_run_ids = entry.run_ids.clone();
        manifest.update(|state| {
            if let Some(e) = state.collections.get_mut(collection) {
                e.run_ids.clear();
            }
        })?;
        for run_id in old_run_ids {
            let path = SortedRun::path_for(data_dir, collection, run_id);
            let _ = std::fs::remove_file(path);
        }
        return Ok(true);
    }

    let new_run_id = entry.next_run_id;
    let new_run = SortedRun::write(data_dir, collection, new_run_id, &live_entries, bloom_fp_rate)?;

    let old_run_ids = entry.run_ids.clone();
    manifest.update(|state| {
        let e = state
            .collections
            .entry(collection.to_string())
            .or_insert_with(CollectionManifest::default);
        e.run_ids = vec![new_run.run_id];
        e.next_run_id = new_run_id + 1;
    })?;

    for run_id in old_run_ids {
        let path = SortedRun::path_for(data_dir, collection, run_id);
        let _ = std::fs::remove_file(path);
    }

    info!(
        collection,
        merged_runs = runs.len(),
        entries = live_entries.len(),
        "compaction merged runs into run {}",
        new_run.run_id
    );
    Ok(true)
}

/// On startup, a crash between writing a new run and installing it in
/// the manifest can leave an orphan `.data` file on disk. Delete any run
/// file whose id is not referenced by the manifest for its collection.
pub fn cleanup_orphan_runs(data_dir: &Path, manifest: &Manifest) -> Result<()> {
    let runs_dir = data_dir.join("runs");
    if !runs_dir.exists() {
        return Ok(());
    }
    let snapshot = manifest.load();
    for entry in std::fs::read_dir(&runs_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((collection, run_id_str)) = name.rsplit_once('_') else {
            continue;
        };
        let Ok(run_id) = run_id_str.parse::<u64>() else {
            continue;
        };
        let referenced = snapshot
            .collections
            .get(collection)
            .map(|c| c.run_ids.contains(&run_id))
            .unwrap_or(false);
        if !referenced {
            warn!(collection, run_id, "removing orphaned sorted run from an incomplete compaction or flush");
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}

/// Long-lived background worker that periodically compacts any
/// collection whose run count exceeds the configured threshold.
/// Modeled as an owned task with explicit start/stop per the design
/// notes: `shutdown()` signals the worker and waits for it to finish its
/// current pass.
pub struct CompactionWorker {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl CompactionWorker {
    pub fn start(
        data_dir: Arc<Path>,
        manifest: Arc<Manifest>,
        threshold: usize,
        bloom_fp_rate: f64,
        interval: Duration,
    ) -> Self
    where
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("nexadb-compactor".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }

                let snapshot = manifest.load();
                let candidates: Vec<String> = snapshot
                    .collections
                    .iter()
                    .filter(|(_, c)| c.run_ids.len() > threshold)
                    .map(|(name, _)| name.clone())
                    .collect();

                for collection in candidates {
                    if let Err(e) =
                        compact_collection(&data_dir, &manifest, &collection, bloom_fp_rate)
                    {
                        warn!(collection, error = %e, "compaction pass failed");
                    }
                }
            })
            .expect("failed to spawn compaction worker thread");

        Self {
            handle: Some(handle),
            shutdown_tx,
        }
    }

    pub fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
