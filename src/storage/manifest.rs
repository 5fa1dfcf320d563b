//! The manifest names the currently-live sorted runs per collection plus
//! index descriptors. Readers take a snapshot (an `Arc`
//! clone) at the start of an operation; writers publish a wholly new
//! immutable snapshot so a manifest swap never blocks or affects
//! in-flight reads — a read-copy-update scheme.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{NexaError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionManifest {
    /// Sorted-run ids, newest first.
    pub run_ids: Vec<u64>,
    pub next_run_id: u64,
    /// WAL segment sequence covered by the most recent flush; segments
    /// at or below this are safe to delete.
    pub flushed_through_segment: u64,
    pub indexed_fields: Vec<String>,
    pub vector_dim: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestState {
    pub schema_version: u32,
    pub collections: HashMap<String, CollectionManifest>,
}

/// RCU-style holder: readers call `load()` for an `Arc` snapshot; writers
/// call `store()` with a freshly built state (typically derived by
/// cloning the previous snapshot and mutating the clone).
pub struct Manifest {
    path: PathBuf,
    state: RwLock<Arc<ManifestState>>,
}

impl Manifest {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("manifest");
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            rmp_serde::from_slice(&bytes)
                .map_err(|e| NexaError::ManifestCorrupt(e.to_string()))?
        } else {
            ManifestState {
                schema_version: 1,
                collections: HashMap::new(),
            }
        };
        Ok(Self {
            path,
            state: RwLock::new(Arc::new(state)),
        })
    }

    pub fn load(&self) -> Arc<ManifestState> {
        self.state.read().clone()
    }

    /// Publishes a new manifest state, persisting it to disk via a
    /// write-then-rename so a crash mid-write cannot leave a torn file.
    pub fn store(&self, new_state: ManifestState) -> Result<()> {
        let bytes =
            rmp_serde::to_vec(&new_state).map_err(|e| NexaError::Internal(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes)?;
        let tmp_file = fs::File::open(&tmp_path)?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            if let Ok(dir_file) = fs::File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }

        *self.state.write() = Arc::new(new_state);
        Ok(())
    }

    /// Convenience for the common case: clone current state, run `f` to
    /// mutate it, persist.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ManifestState),
    {
        let mut next = (*self.load()).clone();
        f(&mut next);
        self.store(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let manifest = Manifest::open(dir.path()).unwrap();
            manifest
                .update(|state| {
                    state.collections.insert(
                        "docs".to_string(),
                        CollectionManifest {
                            run_ids: vec![1, 2],
                            next_run_id: 3,
                            ..Default::default()
                        },
                    );
                })
                .unwrap();
        }
        let manifest = Manifest::open(dir.path()).unwrap();
        let state = manifest.load();
        assert_eq!(state.collections["docs"].run_ids, vec![1, 2]);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_store() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::open(dir.path()).unwrap();
        manifest
            .update(|state| {
                state
                    .collections
                    .insert("docs".to_string(), CollectionManifest::default());
            })
            .unwrap();
        let snapshot = manifest.load();
        manifest
            .update(|state| {
                state.collections.remove("docs");
            })
            .unwrap();
        assert!(snapshot.collections.contains_key("docs"));
        assert!(!manifest.load().collections.contains_key("docs"));
    }
}
