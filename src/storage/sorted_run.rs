//! Immutable, ordered on-disk representation of a memtable or compaction
//! output.
//!
//! Data file layout: a sequence of `key_len(4)‖key‖value_len(4)‖value`
//! records sorted by key, where a tombstone is encoded as
//! `value_len == u32::MAX` with no following bytes. A sparse index
//! (every `SPARSE_INDEX_INTERVAL`-th key mapped to its file offset) plus
//! a bloom filter and summary fields are written as a footer so the
//! whole file can be opened without a separate index file.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{NexaError, Result};
use crate::storage::bloom::BloomFilter;
use crate::storage::memtable::MemtableValue;

const TOMBSTONE_MARKER: u32 = u32::MAX;
const SPARSE_INDEX_INTERVAL: usize = 16;

pub struct SortedRunFooter {
    pub entry_count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub created_at: u64,
    pub sparse_index: Vec<(Vec<u8>, u64)>,
}

/// A single immutable sorted run. `run_id` is the sequence number used
/// both in the file name and as the cache key namespace.
pub struct SortedRun {
    pub run_id: u64,
    pub collection: String,
    pub path: PathBuf,
    pub footer: SortedRunFooter,
    pub bloom: BloomFilter,
    /// Byte offset where the footer begins; the data region is `[0, data_end)`.
    data_end: u64,
}

impl SortedRun {
    pub fn path_for(data_dir: &Path, collection: &str, run_id: u64) -> PathBuf {
        data_dir
            .join("runs")
            .join(format!("{collection}_{run_id}.data"))
    }

    /// Writes a new sorted run from an already key-sorted sequence of
    /// entries (memtable flush or compaction output) and fsyncs it
    /// before returning. Entries carrying a tombstone are still written;
    /// callers that want tombstone-dropping (compaction) filter before
    /// calling this.
    pub fn write(
        data_dir: &Path,
        collection: &str,
        run_id: u64,
        entries: &[(Vec<u8>, MemtableValue)],
        bloom_fp_rate: f64,
    ) -> Result<Self> {
        if entries.is_empty() {
            return Err(NexaError::Internal(
                "cannot create a sorted run with no entries".to_string(),
            ));
        }

        fs::create_dir_all(data_dir.join("runs"))?;
        let path = Self::path_for(data_dir, collection, run_id);
        let mut file = BufWriter::new(File::create(&path)?);

        let mut sparse_index = Vec::new();
        let mut offset: u64 = 0;
        for (i, (key, value)) in entries.iter().enumerate() {
            if i % SPARSE_INDEX_INTERVAL == 0 {
                sparse_index.push((key.clone(), offset));
            }
            offset += Self::write_record(&mut file, key, value)?;
        }

        let bloom = BloomFilter::build(entries.iter().map(|(k, _)| k.as_slice()), bloom_fp_rate);
        let bloom_bytes = bloom.to_bytes();

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let footer_start = offset;
        Self::write_footer(
            &mut file,
            entries.len() as u64,
            &entries[0].0,
            &entries[entries.len() - 1].0,
            created_at,
            &sparse_index,
            &bloom_bytes,
        )?;
        file.write_u64::<BigEndian>(footer_start)?;

        file.flush()?;
        file.get_ref().sync_all()?;

        Ok(Self {
            run_id,
            collection: collection.to_string(),
            path,
            footer: SortedRunFooter {
                entry_count: entries.len() as u64,
                min_key: entries[0].0.clone(),
                max_key: entries[entries.len() - 1].0.clone(),
                created_at,
                sparse_index,
            },
            bloom,
            data_end: footer_start,
        })
    }

    fn write_record<W: Write>(w: &mut W, key: &[u8], value: &MemtableValue) -> Result<u64> {
        w.write_u32::<BigEndian>(key.len() as u32)?;
        w.write_all(key)?;
        match value {
            MemtableValue::Value(v) => {
                w.write_u32::<BigEndian>(v.len() as u32)?;
                w.write_all(v)?;
                Ok(8 + key.len() as u64 + v.len() as u64)
            }
            MemtableValue::Tombstone => {
                w.write_u32::<BigEndian>(TOMBSTONE_MARKER)?;
                Ok(8 + key.len() as u64)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_footer<W: Write>(
        w: &mut W,
        entry_count: u64,
        min_key: &[u8],
        max_key: &[u8],
        created_at: u64,
        sparse_index: &[(Vec<u8>, u64)],
        bloom_bytes: &[u8],
    ) -> Result<()> {
        w.write_u64::<BigEndian>(entry_count)?;
        w.write_u32::<BigEndian>(min_key.len() as u32)?;
        w.write_all(min_key)?;
        w.write_u32::<BigEndian>(max_key.len() as u32)?;
        w.write_all(max_key)?;
        w.write_u64::<BigEndian>(created_at)?;

        w.write_u32::<BigEndian>(sparse_index.len() as u32)?;
        for (key, off) in sparse_index {
            w.write_u32::<BigEndian>(key.len() as u32)?;
            w.write_all(key)?;
            w.write_u64::<BigEndian>(*off)?;
        }

        w.write_u32::<BigEndian>(bloom_bytes.len() as u32)?;
        w.write_all(bloom_bytes)?;
        Ok(())
    }

    /// Opens an existing run file, reading only the footer.
    pub fn open(path: PathBuf, collection: &str, run_id: u64) -> Result<Self> {
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < 8 {
            return Err(NexaError::ManifestCorrupt(format!(
                "sorted run {} is too small",
                path.display()
            )));
        }

        file.seek(SeekFrom::End(-8))?;
        let footer_start = file.read_u64::<BigEndian>()?;
        file.seek(SeekFrom::Start(footer_start))?;
        let mut reader = BufReader::new(file);

        let entry_count = reader.read_u64::<BigEndian>()?;
        let min_key = read_vec(&mut reader)?;
        let max_key = read_vec(&mut reader)?;
        let created_at = reader.read_u64::<BigEndian>()?;

        let sparse_len = reader.read_u32::<BigEndian>()? as usize;
        let mut sparse_index = Vec::with_capacity(sparse_len);
        for _ in 0..sparse_len {
            let key = read_vec(&mut reader)?;
            let off = reader.read_u64::<BigEndian>()?;
            sparse_index.push((key, off));
        }

        let bloom_len = reader.read_u32::<BigEndian>()? as usize;
        let mut bloom_bytes = vec![0u8; bloom_len];
        reader.read_exact(&mut bloom_bytes)?;
        let bloom = BloomFilter::from_bytes(bloom_bytes)
            .ok_or_else(|| NexaError::ManifestCorrupt("bad bloom filter bytes".to_string()))?;

        Ok(Self {
            run_id,
            collection: collection.to_string(),
            path,
            footer: SortedRunFooter {
                entry_count,
                min_key,
                max_key,
                created_at,
                sparse_index,
            },
            bloom,
            data_end: footer_start,
        })
    }

    /// Point lookup. Consults the bloom filter first; on a negative,
    /// returns `None` without touching the data region at all.
    pub fn get(&self, key: &[u8]) -> Result<Option<MemtableValue>> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        if key < self.footer.min_key.as_slice() || key > self.footer.max_key.as_slice() {
            return Ok(None);
        }

        let start_offset = self.sparse_lower_bound(key);
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start_offset))?;
        let mut reader = BufReader::new(file);

        loop {
            let record_offset = reader.stream_position()?;
            if record_offset >= self.data_end {
                break;
            }
            let this_key = match read_vec(&mut reader) {
                Ok(k) => k,
                Err(_) => break,
            };
            let value_len = reader.read_u32::<BigEndian>()?;
            let value = if value_len == TOMBSTONE_MARKER {
                MemtableValue::Tombstone
            } else {
                let mut buf = vec![0u8; value_len as usize];
                reader.read_exact(&mut buf)?;
                MemtableValue::Value(buf)
            };

            if this_key == key {
                return Ok(Some(value));
            }
            if this_key.as_slice() > key {
                break;
            }
        }
        Ok(None)
    }

    fn sparse_lower_bound(&self, key: &[u8]) -> u64 {
        let mut offset = 0u64;
        for (sampled_key, off) in &self.footer.sparse_index {
            if sampled_key.as_slice() <= key {
                offset = *off;
            } else {
                break;
            }
        }
        offset
    }

    /// Full ordered scan, used by compaction's N-way merge.
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, MemtableValue)>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut out = Vec::with_capacity(self.footer.entry_count as usize);
        for _ in 0..self.footer.entry_count {
            let key = read_vec(&mut reader)?;
            let value_len = reader.read_u32::<BigEndian>()?;
            let value = if value_len == TOMBSTONE_MARKER {
                MemtableValue::Tombstone
            } else {
                let mut buf = vec![0u8; value_len as usize];
                reader.read_exact(&mut buf)?;
                MemtableValue::Value(buf)
            };
            out.push((key, value));
        }
        Ok(out)
    }

    pub fn remove_file(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

fn read_vec<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries() -> Vec<(Vec<u8>, MemtableValue)> {
        vec![
            (b"a".to_vec(), MemtableValue::Value(b"1".to_vec())),
            (b"b".to_vec(), MemtableValue::Tombstone),
            (b"c".to_vec(), MemtableValue::Value(b"3".to_vec())),
        ]
    }

    #[test]
    fn writes_and_reads_back() {
        let dir = tempdir().unwrap();
        let run = SortedRun::write(dir.path(), "docs", 1, &entries(), 0.01).unwrap();
        assert_eq!(
            run.get(b"a").unwrap().unwrap().as_value(),
            Some(&b"1"[..])
        );
        assert!(matches!(
            run.get(b"b").unwrap().unwrap(),
            MemtableValue::Tombstone
        ));
        assert!(run.get(b"z").unwrap().is_none());
    }

    #[test]
    fn reopens_from_disk() {
        let dir = tempdir().unwrap();
        let path;
        {
            let run = SortedRun::write(dir.path(), "docs", 1, &entries(), 0.01).unwrap();
            path = run.path.clone();
        }
        let run = SortedRun::open(path, "docs", 1).unwrap();
        assert_eq!(run.footer.entry_count, 3);
        assert_eq!(
            run.get(b"c").unwrap().unwrap().as_value(),
            Some(&b"3"[..])
        );
    }

    #[test]
    fn scan_returns_all_entries_in_order() {
        let dir = tempdir().unwrap();
        let run = SortedRun::write(dir.path(), "docs", 1, &entries(), 0.01).unwrap();
        let scanned = run.scan().unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
