//! Document id generation: 16 lowercase hex characters derived
//! from a high-resolution timestamp and a per-process counter, so ids
//! sort roughly by insertion time and collide only if two ids are
//! generated in the same microsecond with the counter wrapping — judged
//! negligible at the per-process call rates this engine sees.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generates a fresh id: 48 bits of microsecond timestamp followed by 16
/// bits of wrapping per-process counter, hex-encoded to exactly 16
/// characters.
pub fn generate_doc_id() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
        & 0x0000_FFFF_FFFF_FFFF;
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed) as u64 & 0xFFFF;
    let combined = (micros << 16) | counter;
    format!("{combined:016x}")
}

pub fn is_valid_doc_id(s: &str) -> bool {
    s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
