//! Database and catalog layer: namespacing for
//! collections, plus the catalog of all databases on this engine. The
//! `default` database always exists and cannot be dropped.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::document::collection::Collection;
use crate::document::keys::{
    collection_prefix, is_valid_collection_name, is_valid_database_name, meta_db_key, meta_db_prefix,
};
use crate::error::{NexaError, Result};
use crate::storage::engine::StorageEngine;
use crate::storage::wal::{Durability, WalRecord};

pub const DEFAULT_DATABASE: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseRecord {
    name: String,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub name: String,
    pub collections: Vec<String>,
    pub document_count: usize,
}

/// One database's collections, created lazily on first access (spec
/// §4.10 names no explicit "create collection" request; a document
/// store's usual ergonomics is to vivify the collection on first use,
/// while `create_index`/`create_vector_index` remain explicit admin
/// operations). The shard is registered in the manifest immediately so
/// it's visible to `list_collections` before anything is ever flushed.
pub struct Database {
    engine: Arc<StorageEngine>,
    name: String,
    index_defaults: IndexConfig,
    hnsw_dir: PathBuf,
    collections: DashMap<String, Arc<Collection>>,
}

impl Database {
    fn new(engine: Arc<StorageEngine>, name: String, index_defaults: IndexConfig, hnsw_dir: PathBuf) -> Self {
        Self {
            engine,
            name,
            index_defaults,
            hnsw_dir,
            collections: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        if !is_valid_collection_name(name) {
            return Err(NexaError::InvalidCollection(name.to_string()));
        }
        if let Some(existing) = self.collections.get(name) {
            return Ok(existing.clone());
        }
        let shard = format!("db:{}:col:{}", self.name, name);
        self.engine.manifest().update(|state| {
            state.collections.entry(shard.clone()).or_default();
        })?;
        let collection = Arc::new(Collection::new(
            self.engine.clone(),
            self.name.clone(),
            name.to_string(),
            self.index_defaults.clone(),
            self.hnsw_dir.clone(),
        ));
        self.collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    pub fn list_collections(&self) -> Vec<String> {
        let prefix = format!("db:{}:col:", self.name);
        self.engine
            .manifest()
            .load()
            .collections
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        let collections = self.list_collections();
        let mut document_count = 0;
        for name in &collections {
            document_count += self.collection(name)?.count(&crate::document::value::Document::new())?;
        }
        Ok(DatabaseStats {
            name: self.name.clone(),
            collections,
            document_count,
        })
    }
}

/// The catalog of all databases on this engine.
pub struct Catalog {
    engine: Arc<StorageEngine>,
    index_defaults: IndexConfig,
    hnsw_dir: PathBuf,
    databases: DashMap<String, Arc<Database>>,
}

impl Catalog {
    pub fn open(engine: Arc<StorageEngine>, index_defaults: IndexConfig, hnsw_dir: PathBuf) -> Result<Self> {
        let catalog = Self {
            engine,
            index_defaults,
            hnsw_dir,
            databases: DashMap::new(),
        };
        match catalog.create_database(DEFAULT_DATABASE) {
            Ok(()) | Err(NexaError::Duplicate(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(catalog)
    }

    pub fn create_database(&self, name: &str) -> Result<()> {
        if !is_valid_database_name(name) {
            return Err(NexaError::InvalidDatabase(name.to_string()));
        }
        let key = meta_db_key(name);
        if self.engine.get(&key)?.is_some() {
            return Err(NexaError::Duplicate(name.to_string()));
        }
        let record = DatabaseRecord {
            name: name.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        let bytes = rmp_serde::to_vec_named(&record).map_err(|e| NexaError::Internal(e.to_string()))?;
        self.engine.put(key, bytes, Durability::Sync)?;
        Ok(())
    }

    pub fn drop_database(&self, name: &str) -> Result<()> {
        if name == DEFAULT_DATABASE {
            return Err(NexaError::InvalidDatabase("the default database cannot be dropped".to_string()));
        }
        let key = meta_db_key(name);
        if self.engine.get(&key)?.is_none() {
            return Err(NexaError::NotFound);
        }

        let db = self.database(name)?;
        for collection in db.list_collections() {
            let prefix = collection_prefix(name, &collection);
            let entries = self.engine.scan_prefix(&prefix)?;
            let ops: Vec<WalRecord> = entries.into_iter().map(|(k, _)| WalRecord::delete(k)).collect();
            if !ops.is_empty() {
                self.engine.batch(ops, Durability::Sync)?;
            }
        }
        self.engine.manifest().update(|state| {
            let prefix = format!("db:{name}:col:");
            state.collections.retain(|k, _| !k.starts_with(&prefix));
        })?;
        self.engine.delete(key, Durability::Sync)?;
        self.databases.remove(name);
        Ok(())
    }

    pub fn list_databases(&self) -> Result<Vec<String>> {
        let prefix = meta_db_prefix();
        let entries = self.engine.scan_prefix(&prefix)?;
        Ok(entries
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key[prefix.len()..]).to_string())
            .collect())
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        if let Some(db) = self.databases.get(name) {
            return Ok(db.clone());
        }
        if self.engine.get(&meta_db_key(name))?.is_none() {
            return Err(NexaError::InvalidDatabase(name.to_string()));
        }
        let db = Arc::new(Database::new(
            self.engine.clone(),
            name.to_string(),
            self.index_defaults.clone(),
            self.hnsw_dir.clone(),
        ));
        self.databases.insert(name.to_string(), db.clone());
        Ok(db)
    }
}
