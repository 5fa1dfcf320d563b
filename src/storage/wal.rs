//! Write-ahead log: durable record of every mutation before it becomes
//! visible, enabling crash recovery.
//!
//! Record format: `len(4)‖crc32(4)‖op(1)‖key_len(4)‖key‖value_len(4)‖value‖timestamp(8)`.
//! Segments are append-only files under `<data_dir>/wal/segment_<seq>.log`;
//! a sealed segment is only deleted once the sorted run replacing its
//! memtable is fsynced and registered in the manifest.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crc32fast::Hasher;

use crate::config::StorageConfig;
use crate::error::{NexaError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalOp {
    Put = 0,
    Delete = 1,
}

impl WalOp {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(WalOp::Put),
            1 => Some(WalOp::Delete),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WalRecord {
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
}

impl WalRecord {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            op: WalOp::Put,
            key,
            value,
            timestamp: now_nanos(),
        }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self {
            op: WalOp::Delete,
            key,
            value: Vec::new(),
            timestamp: now_nanos(),
        }
    }

    /// Serializes the payload (everything after `len` and `crc32`) and
    /// returns the full on-disk record bytes.
    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + 4 + self.key.len() + 4 + self.value.len() + 8);
        body.push(self.op as u8);
        body.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.key);
        body.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.value);
        body.extend_from_slice(&self.timestamp.to_be_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn decode_body(body: &[u8]) -> Option<Self> {
        if body.is_empty() {
            return None;
        }
        let op = WalOp::from_byte(body[0])?;
        let mut pos = 1;
        if body.len() < pos + 4 {
            return None;
        }
        let key_len = u32::from_be_bytes(body[pos..pos + 4].try_into().ok()?) as usize;
        pos += 4;
        if body.len() < pos + key_len {
            return None;
        }
        let key = body[pos..pos + key_len].to_vec();
        pos += key_len;
        if body.len() < pos + 4 {
            return None;
        }
        let value_len = u32::from_be_bytes(body[pos..pos + 4].try_into().ok()?) as usize;
        pos += 4;
        if body.len() < pos + value_len {
            return None;
        }
        let value = body[pos..pos + value_len].to_vec();
        pos += value_len;
        if body.len() < pos + 8 {
            return None;
        }
        let timestamp = u64::from_be_bytes(body[pos..pos + 8].try_into().ok()?);
        Some(Self {
            op,
            key,
            value,
            timestamp,
        })
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Whether the caller requires an immediate, per-write fsync or is happy
/// to wait for the next group sync (default path).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    Grouped,
    Sync,
}

struct Segment {
    seq: u64,
    path: PathBuf,
}

struct WalInner {
    writer: BufWriter<File>,
    active_seq: u64,
    pending_since_sync: usize,
    last_sync_at: Instant,
    waiters: Vec<mpsc::Sender<()>>,
    sealed: VecDeque<Segment>,
}

/// Append-only, segmented, group-committing write-ahead log.
pub struct Wal {
    dir: PathBuf,
    batch_size: usize,
    batch_interval: Duration,
    inner: Mutex<WalInner>,
    sync_cv: Condvar,
    timer_shutdown: Mutex<Option<mpsc::Sender<()>>>,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens (creating if needed) the WAL directory, returning the log
    /// plus every valid record recovered from existing segments in
    /// order. Stops at the first invalid record in the *last* segment
    /// and truncates it; a corrupt header in an earlier segment is
    /// fatal unless `repair` is set.
    ///
    /// Always returned behind an `Arc`: a background timer thread holds
    /// its own handle so that a `Grouped` append sitting below both the
    /// size and time thresholds is still woken on `batch_interval`
    /// rather than depending on some later append to trip them.
    pub fn open(cfg: &StorageConfig) -> Result<(Arc<Self>, Vec<WalRecord>)> {
        let dir = cfg.data_dir.join("wal");
        fs::create_dir_all(&dir)?;

        let mut segments = Self::list_segments(&dir)?;
        segments.sort_by_key(|s| s.seq);

        let mut records = Vec::new();
        let mut last_seq = 0u64;
        for (i, seg) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            last_seq = seg.seq;
            match Self::replay_segment(&seg.path, is_last, cfg.repair) {
                Ok(mut recs) => records.append(&mut recs),
                Err(NexaError::CorruptLog) => return Err(NexaError::CorruptLog),
                Err(e) => return Err(e),
            }
        }

        let active_seq = if segments.is_empty() {
            1
        } else {
            last_seq
        };
        let active_path = Self::segment_path(&dir, active_seq);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;

        let mut sealed: VecDeque<Segment> = segments.into_iter().collect();
        if sealed.back().map(|s| s.seq) == Some(active_seq) {
            sealed.pop_back();
        }

        let (timer_shutdown_tx, timer_shutdown_rx) = mpsc::channel::<()>();
        let wal = Arc::new(Wal {
            dir,
            batch_size: cfg.wal_batch_size,
            batch_interval: cfg.wal_batch_interval,
            inner: Mutex::new(WalInner {
                writer: BufWriter::new(file),
                active_seq,
                pending_since_sync: 0,
                last_sync_at: Instant::now(),
                waiters: Vec::new(),
                sealed,
            }),
            sync_cv: Condvar::new(),
            timer_shutdown: Mutex::new(Some(timer_shutdown_tx)),
            timer_handle: Mutex::new(None),
        });

        let timer_wal = wal.clone();
        let interval = wal.batch_interval;
        let handle = std::thread::Builder::new()
            .name("nexadb-wal-sync".to_string())
            .spawn(move || loop {
                match timer_shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
                if let Err(e) = timer_wal.group_sync() {
                    tracing::warn!(error = %e, "periodic WAL sync failed");
                }
            })
            .expect("failed to spawn wal sync timer thread");
        *wal.timer_handle.lock().unwrap() = Some(handle);

        Ok((wal, records))
    }

    fn segment_path(dir: &Path, seq: u64) -> PathBuf {
        dir.join(format!("segment_{seq:010}.log"))
    }

    fn list_segments(dir: &Path) -> Result<Vec<Segment>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some(seq_str) = name.strip_prefix("segment_") {
                    if let Ok(seq) = seq_str.parse::<u64>() {
                        out.push(Segment { seq, path });
                    }
                }
            }
        }
        Ok(out)
    }

    /// Replays one segment file, returning its valid records. If
    /// `is_last` and a record fails to validate, the segment is
    /// truncated to the last valid offset and replay stops there
    /// (instead of erroring). A non-last segment failing the same way
    /// means on-disk corruption the repair flag governs.
    fn replay_segment(path: &Path, is_last: bool, repair: bool) -> Result<Vec<WalRecord>> {
        let mut file = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        let mut valid_upto: u64 = 0;

        loop {
            let mut header = [0u8; 8];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
            let expected_crc = u32::from_be_bytes(header[4..8].try_into().unwrap());

            let mut body = vec![0u8; len];
            if file.read_exact(&mut body).is_err() {
                // partial trailing record
                break;
            }

            let mut hasher = Hasher::new();
            hasher.update(&body);
            if hasher.finalize() != expected_crc {
                break;
            }

            match WalRecord::decode_body(&body) {
                Some(record) => {
                    records.push(record);
                    valid_upto += 8 + len as u64;
                }
                None => break,
            }
        }

        let file_len = fs::metadata(path)?.len();
        if valid_upto != file_len {
            if is_last {
                // Truncate to last valid record and reseal.
                let f = OpenOptions::new().write(true).open(path)?;
                f.set_len(valid_upto)?;
                f.sync_all()?;
            } else if !repair {
                return Err(NexaError::CorruptLog);
            }
        }

        Ok(records)
    }

    /// Appends a record. For `Durability::Sync`, blocks until this
    /// record alone is fsynced. For `Durability::Grouped`, buffers and
    /// blocks until the next group sync (triggered by batch size, batch
    /// interval, or the background timer thread) completes.
    pub fn append(&self, record: &WalRecord, durability: Durability) -> Result<()> {
        self.append_batch(std::slice::from_ref(record), durability)
    }

    /// Appends a whole write group to the buffer in one critical section
    /// and blocks on a single shared acknowledgement for the group as a
    /// whole, rather than making every record in the group wait its own
    /// turn. `durability` governs the group exactly as it would a single
    /// `append` of its last record: `Sync` forces an immediate
    /// group_sync, `Grouped` waits for batch size/interval (or the
    /// background timer) to trigger one.
    pub fn append_batch(&self, records: &[WalRecord], durability: Durability) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let (rx, should_sync_now) = {
            let mut inner = self.inner.lock().unwrap();
            for record in records {
                let encoded = record.encode();
                inner
                    .writer
                    .write_all(&encoded)
                    .map_err(|e| NexaError::StorageUnavailable(e.to_string()))?;
            }
            inner.pending_since_sync += records.len();

            let (tx, rx) = mpsc::channel();
            inner.waiters.push(tx);

            let due_by_count = inner.pending_since_sync >= self.batch_size;
            let due_by_time = inner.last_sync_at.elapsed() >= self.batch_interval;
            let force = durability == Durability::Sync;
            (rx, force || due_by_count || due_by_time)
        };

        if should_sync_now {
            self.group_sync()?;
        }

        // Block for acknowledgement; a sync elsewhere (another thread's
        // batch, or the background timer) also satisfies us because
        // `group_sync` drains all registered waiters.
        let _ = rx.recv();
        Ok(())
    }

    /// Flushes the buffered writer and fsyncs, notifying every waiter
    /// registered since the previous sync. A no-op if nothing has been
    /// appended since then, so the background timer's periodic tick
    /// doesn't fsync an empty buffer while the log is idle.
    fn group_sync(&self) -> Result<()> {
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending_since_sync == 0 {
                return Ok(());
            }
            inner
                .writer
                .flush()
                .map_err(|e| NexaError::StorageUnavailable(e.to_string()))?;
            inner
                .writer
                .get_ref()
                .sync_all()
                .map_err(|e| NexaError::StorageUnavailable(e.to_string()))?;
            inner.pending_since_sync = 0;
            inner.last_sync_at = Instant::now();
            std::mem::take(&mut inner.waiters)
        };
        for tx in waiters {
            let _ = tx.send(());
        }
        self.sync_cv.notify_all();
        Ok(())
    }

    /// Seals the current segment (starting a fresh one) and returns the
    /// sequence number that was active, for the flush worker to track.
    /// Called when the memtable backed by this segment becomes
    /// immutable and is queued for flush.
    pub fn roll_segment(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .writer
            .flush()
            .map_err(|e| NexaError::StorageUnavailable(e.to_string()))?;
        inner
            .writer
            .get_ref()
            .sync_all()
            .map_err(|e| NexaError::StorageUnavailable(e.to_string()))?;

        let sealed_seq = inner.active_seq;
        inner.sealed.push_back(Segment {
            seq: sealed_seq,
            path: Self::segment_path(&self.dir, sealed_seq),
        });

        let new_seq = sealed_seq + 1;
        let new_path = Self::segment_path(&self.dir, new_seq);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)?;
        inner.writer = BufWriter::new(file);
        inner.active_seq = new_seq;
        Ok(sealed_seq)
    }

    /// Deletes every sealed segment up to and including `seq`, called
    /// once the sorted run that absorbed them is durably installed.
    pub fn truncate_through(&self, seq: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(front) = inner.sealed.front() {
            if front.seq > seq {
                break;
            }
            let seg = inner.sealed.pop_front().unwrap();
            let _ = fs::remove_file(&seg.path);
        }
        Ok(())
    }

    /// Stops the background sync timer thread and joins it. Safe to call
    /// more than once.
    pub fn shutdown(&self) {
        if let Some(tx) = self.timer_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.timer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg(dir: &Path) -> StorageConfig {
        StorageConfig {
            data_dir: dir.to_path_buf(),
            wal_batch_size: 2,
            wal_batch_interval: Duration::from_millis(5),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn writes_and_recovers_records() {
        let dir = tempdir().unwrap();
        {
            let (wal, existing) = Wal::open(&cfg(dir.path())).unwrap();
            assert!(existing.is_empty());
            wal.append(
                &WalRecord::put(b"a".to_vec(), b"1".to_vec()),
                Durability::Sync,
            )
            .unwrap();
            wal.append(
                &WalRecord::put(b"b".to_vec(), b"2".to_vec()),
                Durability::Sync,
            )
            .unwrap();
            wal.shutdown();
        }
        let (wal, recovered) = Wal::open(&cfg(dir.path())).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].key, b"a");
        assert_eq!(recovered[1].key, b"b");
        wal.shutdown();
    }

    #[test]
    fn truncates_corrupt_trailing_record() {
        let dir = tempdir().unwrap();
        {
            let (wal, _) = Wal::open(&cfg(dir.path())).unwrap();
            wal.append(
                &WalRecord::put(b"a".to_vec(), b"1".to_vec()),
                Durability::Sync,
            )
            .unwrap();
            wal.shutdown();
        }
        // Corrupt the segment by appending a partial trailing record.
        let seg_path = dir.path().join("wal").join("segment_0000000001.log");
        let mut f = OpenOptions::new().append(true).open(&seg_path).unwrap();
        f.write_all(&[0xFF; 6]).unwrap();

        let (wal, recovered) = Wal::open(&cfg(dir.path())).unwrap();
        assert_eq!(recovered.len(), 1);
        wal.shutdown();
    }

    #[test]
    fn group_commit_batches_by_size() {
        let dir = tempdir().unwrap();
        let (wal, _) = Wal::open(&cfg(dir.path())).unwrap();
        // batch size is 2: the second append's group_sync covers both.
        wal.append(
            &WalRecord::put(b"a".to_vec(), b"1".to_vec()),
            Durability::Grouped,
        )
        .unwrap();
        wal.append(
            &WalRecord::put(b"b".to_vec(), b"2".to_vec()),
            Durability::Grouped,
        )
        .unwrap();
        wal.shutdown();
    }

    #[test]
    fn grouped_append_below_threshold_is_woken_by_background_timer() {
        let dir = tempdir().unwrap();
        let cfg = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            wal_batch_size: 100,
            wal_batch_interval: Duration::from_millis(10),
            ..StorageConfig::default()
        };
        let (wal, _) = Wal::open(&cfg).unwrap();
        // A single Grouped append trips neither the count nor the time
        // threshold on its own; it must still return once the
        // background timer's next tick runs group_sync, rather than
        // waiting forever for some other append that never comes.
        wal.append(
            &WalRecord::put(b"solo".to_vec(), b"1".to_vec()),
            Durability::Grouped,
        )
        .unwrap();
        wal.shutdown();
    }

    #[test]
    fn append_batch_does_not_wait_per_record() {
        let dir = tempdir().unwrap();
        let cfg = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            wal_batch_size: 100,
            wal_batch_interval: Duration::from_secs(60),
            ..StorageConfig::default()
        };
        let (wal, _) = Wal::open(&cfg).unwrap();
        let records = vec![
            WalRecord::put(b"a".to_vec(), b"1".to_vec()),
            WalRecord::put(b"b".to_vec(), b"2".to_vec()),
            WalRecord::delete(b"c".to_vec()),
        ];
        // A single Sync-durability group forces its own sync regardless
        // of batch size/interval, and returns after one shared
        // acknowledgement rather than one per record.
        wal.append_batch(&records, Durability::Sync).unwrap();
        wal.shutdown();
    }
}
