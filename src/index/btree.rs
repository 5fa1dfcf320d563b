//! Secondary B-tree-like index maintenance and probing.
//!
//! There is no separate on-disk structure: an index entry is just another
//! key in the storage engine, `idx:<field>:<collated-value><doc-id>`, so
//! "the index" is simply the ordered range of such keys and a probe is a
//! prefix/range scan that the storage engine already does in sorted
//! order. Sparse by construction: documents missing the indexed field
//! get no entry and are invisible to equality/range probes on it.

use crate::document::keys::{idx_key, idx_key_doc_id, idx_prefix};
use crate::document::value::{Document, Value};
use crate::error::Result;
use crate::storage::engine::StorageEngine;
use crate::storage::wal::WalRecord;

/// Resolves the value an index on `field` should key this document under,
/// following the same dot-path rules as [`Document::get_path`]. Returns
/// `None` for documents missing the field (sparse index).
pub fn indexed_value<'a>(doc: &'a Document, field: &str) -> Option<&'a Value> {
    doc.get_path(field)
}

/// The WAL record adding this document's entry to `field`'s index, or
/// `None` if the document doesn't have the field.
pub fn put_op(db: &str, collection: &str, field: &str, doc_id: &str, doc: &Document) -> Option<WalRecord> {
    let value = indexed_value(doc, field)?;
    let key = idx_key(db, collection, field, &value.encode_sort_key(), doc_id);
    Some(WalRecord::put(key, Vec::new()))
}

/// The WAL record removing this document's entry from `field`'s index, if
/// it has one.
pub fn delete_op(db: &str, collection: &str, field: &str, doc_id: &str, doc: &Document) -> Option<WalRecord> {
    let value = indexed_value(doc, field)?;
    let key = idx_key(db, collection, field, &value.encode_sort_key(), doc_id);
    Some(WalRecord::delete(key))
}

/// Builds the full set of index-maintenance WAL records needed to move a
/// document from `before` (or absent, on insert) to `after` (or absent,
/// on delete) across every indexed field, so callers can fold them into
/// the same write group as the document body.
pub fn diff_ops(
    db: &str,
    collection: &str,
    indexed_fields: &[String],
    doc_id: &str,
    before: Option<&Document>,
    after: Option<&Document>,
) -> Vec<WalRecord> {
    let mut ops = Vec::new();
    for field in indexed_fields {
        let before_value = before.and_then(|d| indexed_value(d, field));
        let after_value = after.and_then(|d| indexed_value(d, field));
        if before_value == after_value {
            continue;
        }
        if let (Some(before_doc), Some(op)) = (before, before.and_then(|d| delete_op(db, collection, field, doc_id, d)))
        {
            let _ = before_doc;
            ops.push(op);
        }
        if let Some(after_doc) = after {
            if let Some(op) = put_op(db, collection, field, doc_id, after_doc) {
                ops.push(op);
            }
        }
    }
    ops
}

/// Equality probe: every doc id with exactly `value` at `field`, in doc-id
/// order (stable because the suffix of the index key is the doc id).
pub fn probe_eq(
    engine: &StorageEngine,
    db: &str,
    collection: &str,
    field: &str,
    value: &Value,
) -> Result<Vec<String>> {
    let mut prefix = idx_prefix(db, collection, field);
    prefix.extend_from_slice(&value.encode_sort_key());
    let entries = engine.scan_prefix(&prefix)?;
    Ok(entries
        .into_iter()
        .filter_map(|(key, _)| idx_key_doc_id(&key).map(str::to_string))
        .collect())
}

/// Range probe: every doc id whose indexed value's collated sort-key
/// falls within `[min, max)` (either bound optional), returned in
/// ascending value order (sort-key collation order).
pub fn probe_range(
    engine: &StorageEngine,
    db: &str,
    collection: &str,
    field: &str,
    min: Option<&Value>,
    max: Option<&Value>,
) -> Result<Vec<String>> {
    let prefix = idx_prefix(db, collection, field);
    let entries = engine.scan_prefix(&prefix)?;
    let min_key = min.map(|v| v.encode_sort_key());
    let max_key = max.map(|v| v.encode_sort_key());

    let mut out = Vec::new();
    for (key, _) in entries {
        let value_bytes = &key[prefix.len()..key.len().saturating_sub(crate::document::keys::DOC_ID_LEN)];
        if let Some(min_key) = &min_key {
            if value_bytes < min_key.as_slice() {
                continue;
            }
        }
        if let Some(max_key) = &max_key {
            if value_bytes >= max_key.as_slice() {
                continue;
            }
        }
        if let Some(doc_id) = idx_key_doc_id(&key) {
            out.push(doc_id.to_string());
        }
    }
    Ok(out)
}
