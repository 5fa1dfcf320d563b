//! A single collection's document operations: encode/decode,
//! id assignment, reserved-field bookkeeping, secondary-index and vector-
//! index maintenance, and the query surface built on top.
//!
//! All mutation for one logical operation (document body, index diffs,
//! vector payload) travels through a single [`StorageEngine::batch`]
//! call so a crash sees the whole group or none of it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::config::IndexConfig;
use crate::document::codec::{decode_document, encode_document};
use crate::document::id::{generate_doc_id, is_valid_doc_id};
use crate::document::keys::{doc_key, doc_prefix, vec_key, vec_prefix};
use crate::document::value::{Document, Value};
use crate::error::{NexaError, Result};
use crate::index::btree;
use crate::index::hnsw::{HnswIndex, HnswParams};
use crate::query::{aggregate, filter, sort};
use crate::storage::engine::StorageEngine;
use crate::storage::manifest::CollectionManifest;
use crate::storage::wal::{Durability, WalRecord};

/// Reserved field name for a document's vector embedding.
pub const VECTOR_FIELD: &str = "_vector";

pub struct Collection {
    engine: Arc<StorageEngine>,
    database: String,
    name: String,
    index_defaults: IndexConfig,
    hnsw_dir: PathBuf,
    vector_index: RwLock<Option<Arc<HnswIndex>>>,
}

impl Collection {
    pub(crate) fn new(
        engine: Arc<StorageEngine>,
        database: String,
        name: String,
        index_defaults: IndexConfig,
        hnsw_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            database,
            name,
            index_defaults,
            hnsw_dir,
            vector_index: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn shard(&self) -> String {
        format!("db:{}:col:{}", self.database, self.name)
    }

    fn manifest_entry(&self) -> CollectionManifest {
        self.engine
            .manifest()
            .load()
            .collections
            .get(&self.shard())
            .cloned()
            .unwrap_or_default()
    }

    pub fn indexed_fields(&self) -> Vec<String> {
        self.manifest_entry().indexed_fields
    }

    pub fn vector_dim(&self) -> Option<usize> {
        self.manifest_entry().vector_dim
    }

    fn hnsw_path(&self) -> PathBuf {
        self.hnsw_dir.join(format!("{}_{}.graph", self.database, self.name))
    }

    /// Declares a secondary index on `field` and backfills entries for
    /// every document already present.
    pub fn create_index(&self, field: &str) -> Result<()> {
        let shard = self.shard();
        self.engine.manifest().update(|state| {
            let entry = state.collections.entry(shard.clone()).or_default();
            if !entry.indexed_fields.iter().any(|f| f == field) {
                entry.indexed_fields.push(field.to_string());
            }
        })?;

        let docs = self.scan_all()?;
        let ops: Vec<WalRecord> = docs
            .iter()
            .filter_map(|(doc_id, doc)| btree::put_op(&self.database, &self.name, field, doc_id, doc))
            .collect();
        if !ops.is_empty() {
            self.engine.batch(ops, Durability::Sync)?;
        }
        Ok(())
    }

    /// Declares the collection's vector dimensionality and (re)builds the
    /// HNSW graph from documents already carrying `_vector`.
    pub fn create_vector_index(&self, dim: usize) -> Result<()> {
        let shard = self.shard();
        self.engine.manifest().update(|state| {
            let entry = state.collections.entry(shard.clone()).or_default();
            entry.vector_dim = Some(dim);
        })?;
        self.rebuild_vector_index(dim)
    }

    fn vector_params(&self) -> HnswParams {
        HnswParams {
            m: self.index_defaults.hnsw_m,
            ef_construction: self.index_defaults.hnsw_ef_construction,
            ef_search: self.index_defaults.hnsw_ef_search,
        }
    }

    /// Loads the persisted graph if present, or an empty one otherwise.
    /// Cached for the life of this `Collection` handle.
    fn vector_index(&self) -> Result<Arc<HnswIndex>> {
        if let Some(existing) = self.vector_index.read().clone() {
            return Ok(existing);
        }
        let dim = self
            .vector_dim()
            .ok_or_else(|| NexaError::InvalidQuery("collection has no declared vector index".to_string()))?;
        let path = self.hnsw_path();
        let index = if path.exists() {
            Arc::new(HnswIndex::load(&path)?)
        } else {
            Arc::new(HnswIndex::new(dim, self.vector_params()))
        };
        *self.vector_index.write() = Some(index.clone());
        Ok(index)
    }

    /// Rebuilds the graph from a fresh scan of `vec:` entries, replacing
    /// any in-memory/on-disk index atomically.
    pub fn rebuild_vector_index(&self, dim: usize) -> Result<()> {
        let prefix = vec_prefix(&self.database, &self.name);
        let entries = self.engine.scan_prefix(&prefix)?;
        let index = HnswIndex::new(dim, self.vector_params());
        let vectors = entries.into_iter().filter_map(|(key, bytes)| {
            let doc_id = key[prefix.len()..].to_vec();
            let doc_id = String::from_utf8(doc_id).ok()?;
            let vector: Vec<f32> = rmp_serde::from_slice(&bytes).ok()?;
            Some((doc_id, vector))
        });
        index.build(vectors)?;
        index.save(&self.hnsw_path())?;
        *self.vector_index.write() = Some(Arc::new(index));
        Ok(())
    }

    pub fn search_vector(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        self.vector_index()?.search(query, k)
    }

    /// Whether the persisted graph's tombstoned-vector ratio has crossed
    /// the configured threshold, signaling a rebuild is due.
    pub fn vector_index_needs_rebuild(&self) -> Result<bool> {
        let index = self.vector_index()?;
        Ok(index.tombstoned_ratio() > self.index_defaults.hnsw_stale_delete_ratio)
    }

    fn extract_vector(doc: &Document) -> Option<Vec<f32>> {
        let values = doc.get(VECTOR_FIELD)?.as_array()?;
        values.iter().map(|v| v.as_f64().map(|f| f as f32)).collect()
    }

    fn scan_all(&self) -> Result<Vec<(String, Document)>> {
        let prefix = doc_prefix(&self.database, &self.name);
        let entries = self.engine.scan_prefix(&prefix)?;
        entries
            .into_iter()
            .map(|(key, bytes)| {
                let doc_id = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
                Ok((doc_id, decode_document(&bytes)?))
            })
            .collect()
    }

    pub fn insert(&self, mut doc: Document) -> Result<String> {
        let doc_id = match doc.get("_id") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(NexaError::InvalidQuery("_id must be a string".to_string())),
            None => generate_doc_id(),
        };
        if !is_valid_doc_id(&doc_id) {
            return Err(NexaError::InvalidQuery("_id must be 16 lowercase hex characters".to_string()));
        }
        let key = doc_key(&self.database, &self.name, &doc_id);
        if self.engine.get(&key)?.is_some() {
            return Err(NexaError::Duplicate(doc_id));
        }

        let now = Utc::now().to_rfc3339();
        doc.set("_id", Value::String(doc_id.clone()));
        doc.set("_created_at", Value::String(now.clone()));
        doc.set("_updated_at", Value::String(now));

        let mut ops = vec![WalRecord::put(key, encode_document(&doc)?)];
        ops.extend(btree::diff_ops(&self.database, &self.name, &self.indexed_fields(), &doc_id, None, Some(&doc)));

        let vector = Self::extract_vector(&doc);
        if let (Some(dim), Some(v)) = (self.vector_dim(), vector.as_ref()) {
            if v.len() == dim {
                ops.push(WalRecord::put(
                    vec_key(&self.database, &self.name, &doc_id),
                    rmp_serde::to_vec(v).map_err(|e| NexaError::Internal(e.to_string()))?,
                ));
            }
        }

        self.engine.batch(ops, Durability::Sync)?;

        if let (Some(dim), Some(v)) = (self.vector_dim(), vector) {
            if v.len() == dim {
                self.vector_index()?.insert(doc_id.clone(), v)?;
            }
        }
        Ok(doc_id)
    }

    pub fn get(&self, doc_id: &str) -> Result<Document> {
        let key = doc_key(&self.database, &self.name, doc_id);
        let bytes = self.engine.get(&key)?.ok_or(NexaError::NotFound)?;
        decode_document(&bytes)
    }

    /// Shallow-merges `patch` into the stored document. `_id`/`_created_at` are
    /// immutable; `_updated_at` is stamped with the current time.
    pub fn update(&self, doc_id: &str, patch: &Document) -> Result<()> {
        let before = self.get(doc_id)?;
        let mut after = before.clone();
        after.merge_shallow(patch);
        after.set("_id", before.get("_id").cloned().unwrap_or(Value::String(doc_id.to_string())));
        if let Some(created) = before.get("_created_at").cloned() {
            after.set("_created_at", created);
        }
        after.set("_updated_at", Value::String(Utc::now().to_rfc3339()));
        self.write_replacement(doc_id, &before, after)
    }

    /// Full replacement preserving `_id`/`_created_at`.
    pub fn replace(&self, doc_id: &str, mut doc: Document) -> Result<()> {
        let before = self.get(doc_id)?;
        doc.set("_id", before.get("_id").cloned().unwrap_or(Value::String(doc_id.to_string())));
        if let Some(created) = before.get("_created_at").cloned() {
            doc.set("_created_at", created);
        }
        doc.set("_updated_at", Value::String(Utc::now().to_rfc3339()));
        self.write_replacement(doc_id, &before, doc)
    }

    fn write_replacement(&self, doc_id: &str, before: &Document, after: Document) -> Result<()> {
        let key = doc_key(&self.database, &self.name, doc_id);
        let mut ops = vec![WalRecord::put(key, encode_document(&after)?)];
        ops.extend(btree::diff_ops(
            &self.database,
            &self.name,
            &self.indexed_fields(),
            doc_id,
            Some(before),
            Some(&after),
        ));

        let before_vector = Self::extract_vector(before);
        let after_vector = Self::extract_vector(&after);
        if before_vector != after_vector {
            if let Some(v) = &after_vector {
                ops.push(WalRecord::put(
                    vec_key(&self.database, &self.name, doc_id),
                    rmp_serde::to_vec(v).map_err(|e| NexaError::Internal(e.to_string()))?,
                ));
            } else if before_vector.is_some() {
                ops.push(WalRecord::delete(vec_key(&self.database, &self.name, doc_id)));
            }
        }

        self.engine.batch(ops, Durability::Sync)?;

        if before_vector != after_vector {
            if let (Some(dim), Some(v)) = (self.vector_dim(), after_vector) {
                if v.len() == dim {
                    self.vector_index()?.insert(doc_id.to_string(), v)?;
                }
            } else if self.vector_dim().is_some() {
                self.vector_index()?.delete(doc_id);
            }
        }
        Ok(())
    }

    /// Tombstones the document and removes every secondary-index and
    /// vector entry referring to it.
    pub fn delete(&self, doc_id: &str) -> Result<()> {
        let before = self.get(doc_id)?;
        let key = doc_key(&self.database, &self.name, doc_id);
        let mut ops = vec![WalRecord::delete(key)];
        ops.extend(btree::diff_ops(
            &self.database,
            &self.name,
            &self.indexed_fields(),
            doc_id,
            Some(&before),
            None,
        ));
        if Self::extract_vector(&before).is_some() {
            ops.push(WalRecord::delete(vec_key(&self.database, &self.name, doc_id)));
        }
        self.engine.batch(ops, Durability::Sync)?;

        if self.vector_dim().is_some() {
            self.vector_index()?.delete(doc_id);
        }
        Ok(())
    }

    /// Atomic multi-document insert: every document (plus its index and
    /// vector writes) lands in a single WAL write group.
    pub fn batch_write(&self, docs: Vec<Document>) -> Result<Vec<String>> {
        let now = Utc::now().to_rfc3339();
        let mut ids = Vec::with_capacity(docs.len());
        let mut ops = Vec::new();
        let indexed_fields = self.indexed_fields();
        let dim = self.vector_dim();
        let mut vectors_to_insert = Vec::new();

        for mut doc in docs {
            let doc_id = match doc.get("_id") {
                Some(Value::String(s)) => s.clone(),
                Some(_) => return Err(NexaError::InvalidQuery("_id must be a string".to_string())),
                None => generate_doc_id(),
            };
            let key = doc_key(&self.database, &self.name, &doc_id);
            if self.engine.get(&key)?.is_some() {
                return Err(NexaError::Duplicate(doc_id));
            }
            doc.set("_id", Value::String(doc_id.clone()));
            doc.set("_created_at", Value::String(now.clone()));
            doc.set("_updated_at", Value::String(now.clone()));

            ops.push(WalRecord::put(key, encode_document(&doc)?));
            ops.extend(btree::diff_ops(&self.database, &self.name, &indexed_fields, &doc_id, None, Some(&doc)));

            if let (Some(dim), Some(v)) = (dim, Self::extract_vector(&doc)) {
                if v.len() == dim {
                    ops.push(WalRecord::put(
                        vec_key(&self.database, &self.name, &doc_id),
                        rmp_serde::to_vec(&v).map_err(|e| NexaError::Internal(e.to_string()))?,
                    ));
                    vectors_to_insert.push((doc_id.clone(), v));
                }
            }
            ids.push(doc_id);
        }

        self.engine.batch(ops, Durability::Sync)?;

        if !vectors_to_insert.is_empty() {
            let index = self.vector_index()?;
            for (doc_id, v) in vectors_to_insert {
                index.insert(doc_id, v)?;
            }
        }
        Ok(ids)
    }

    /// Probes a secondary index for the filter's top-level equality
    /// predicates when one exists, then applies the full filter as a
    /// residual pass over the candidate set; falls back to a full
    /// collection scan when no indexed field has an eligible predicate
    ///.
    fn candidate_documents(&self, query_filter: &Document) -> Result<Vec<(String, Document)>> {
        for field in self.indexed_fields() {
            if let Some(value) = filter::equality_value_for(query_filter, &field) {
                let ids = btree::probe_eq(&self.engine, &self.database, &self.name, &field, value)?;
                return self.fetch_by_id(ids);
            }
            if let Some((min, max)) = filter::range_bounds_for(query_filter, &field) {
                let ids = btree::probe_range(&self.engine, &self.database, &self.name, &field, min, max)?;
                return self.fetch_by_id(ids);
            }
        }
        self.scan_all()
    }

    fn fetch_by_id(&self, ids: Vec<String>) -> Result<Vec<(String, Document)>> {
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(doc) = self.get(&id) {
                docs.push((id, doc));
            }
        }
        Ok(docs)
    }

    pub fn find(
        &self,
        query_filter: &Document,
        sort_spec: Option<&Document>,
        skip: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let candidates = self.candidate_documents(query_filter)?;
        let mut docs = Vec::with_capacity(candidates.len());
        for (_, doc) in candidates {
            if filter::matches(&doc, query_filter)? {
                docs.push(doc);
            }
        }
        if let Some(spec) = sort_spec {
            sort::sort_documents(&mut docs, &sort::parse_sort_spec(spec));
        }
        let skip = skip.unwrap_or(0).min(docs.len());
        let mut docs = docs.split_off(skip);
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    pub fn count(&self, query_filter: &Document) -> Result<usize> {
        if query_filter.is_empty() {
            return Ok(self.scan_all()?.len());
        }
        Ok(self.find(query_filter, None, None, None)?.len())
    }

    pub fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Document>> {
        let docs: Vec<Document> = self.scan_all()?.into_iter().map(|(_, d)| d).collect();
        aggregate::run_pipeline(docs, pipeline)
    }
}
