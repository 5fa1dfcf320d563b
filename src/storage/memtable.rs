//! In-memory ordered structure absorbing current writes.
//!
//! Backed by a lock-free skip list so point lookups and range scans on
//! the active memtable never block behind a writer. Size accounting uses
//! an atomic counter so `should_flush` can be polled without taking any
//! lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

const ENTRY_OVERHEAD: usize = 48;

#[derive(Clone, Debug)]
pub enum MemtableValue {
    Value(Vec<u8>),
    Tombstone,
}

impl MemtableValue {
    pub fn as_value(&self) -> Option<&[u8]> {
        match self {
            MemtableValue::Value(v) => Some(v),
            MemtableValue::Tombstone => None,
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    value: MemtableValue,
    /// Monotonic write sequence, used to keep last-writer-wins ordering
    /// stable even though the skip list itself is unordered by insert time.
    seq: u64,
}

/// A single memtable generation. Immutable ones are handed to the flush
/// worker; the active one absorbs new writes.
pub struct Memtable {
    data: SkipMap<Vec<u8>, Entry>,
    size_bytes: AtomicUsize,
    max_size_bytes: usize,
    next_seq: AtomicUsize,
}

impl Memtable {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_size_bytes,
            next_seq: AtomicUsize::new(0),
        }
    }

    fn entry_size(key: &[u8], value: &MemtableValue) -> usize {
        let value_len = match value {
            MemtableValue::Value(v) => v.len(),
            MemtableValue::Tombstone => 0,
        };
        key.len() + value_len + ENTRY_OVERHEAD
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.insert(key, MemtableValue::Value(value));
    }

    pub fn delete(&self, key: Vec<u8>) {
        self.insert(key, MemtableValue::Tombstone);
    }

    fn insert(&self, key: Vec<u8>, value: MemtableValue) {
        let added = Self::entry_size(&key, &value);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) as u64;

        let removed = self.data.get(&key).map(|e| {
            let old = e.value();
            Self::entry_size(&key, &old.value)
        });

        self.data.insert(key, Entry { value, seq });

        if let Some(removed) = removed {
            self.size_bytes.fetch_sub(removed, Ordering::Relaxed);
        }
        self.size_bytes.fetch_add(added, Ordering::Relaxed);
    }

    pub fn get(&self, key: &[u8]) -> Option<MemtableValue> {
        self.data.get(key).map(|e| e.value().value.clone())
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn should_flush(&self) -> bool {
        self.size_bytes() >= self.max_size_bytes
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of all entries sorted by key, for flushing into a sorted
    /// run. The skip list already maintains key order.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, MemtableValue)> {
        self.data
            .iter()
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    /// Iterates entries within `[start, end)` in key order, honoring only
    /// the prefix bound (used for "all documents in a collection" style
    /// scans); `end` is exclusive.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, MemtableValue)> {
        self.data
            .range(start.to_vec()..end.to_vec())
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins() {
        let mt = Memtable::new(1024 * 1024);
        mt.put(b"k".to_vec(), b"1".to_vec());
        mt.put(b"k".to_vec(), b"2".to_vec());
        assert_eq!(mt.get(b"k").unwrap().as_value(), Some(&b"2"[..]));
    }

    #[test]
    fn delete_is_tombstone() {
        let mt = Memtable::new(1024 * 1024);
        mt.put(b"k".to_vec(), b"1".to_vec());
        mt.delete(b"k".to_vec());
        assert!(matches!(mt.get(b"k"), Some(MemtableValue::Tombstone)));
    }

    #[test]
    fn size_accounting_tracks_overwrite() {
        let mt = Memtable::new(1024 * 1024);
        mt.put(b"k".to_vec(), vec![0u8; 100]);
        let first = mt.size_bytes();
        mt.put(b"k".to_vec(), vec![0u8; 10]);
        assert!(mt.size_bytes() < first);
    }

    #[test]
    fn should_flush_past_threshold() {
        let mt = Memtable::new(16);
        assert!(!mt.should_flush());
        mt.put(b"key".to_vec(), vec![0u8; 64]);
        assert!(mt.should_flush());
    }

    #[test]
    fn range_scan_is_key_ordered() {
        let mt = Memtable::new(1024 * 1024);
        mt.put(b"b".to_vec(), b"2".to_vec());
        mt.put(b"a".to_vec(), b"1".to_vec());
        mt.put(b"c".to_vec(), b"3".to_vec());
        let all = mt.range(b"", b"\xff");
        let keys: Vec<_> = all.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
