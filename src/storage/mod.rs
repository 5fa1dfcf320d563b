//! L1 storage engine: WAL, memtable, sorted runs, bloom
//! filters, block cache, and compaction, wired together by [`engine::StorageEngine`].
//!
//! Everything below this module is key-schema agnostic: it stores and
//! retrieves opaque byte keys and values. The one exception is
//! [`engine::shard_of`], which groups keys into per-collection sorted-run
//! families using the `db:<database>:col:<collection>:...` / `meta:...`
//! key prefix convention, so that compaction and read
//! amplification stay bounded per collection rather than growing across
//! the whole database.

pub mod bloom;
pub mod cache;
pub mod compaction;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sorted_run;
pub mod wal;

pub use engine::StorageEngine;
pub use wal::Durability;
