//! Access-bookkeeping queue.
//!
//! Bumping `access_count` on every recall would turn each read into a write.
//! Instead, recalls record their returned ids here; hits on the same id
//! coalesce into one row update. The engine flushes the queue when it grows
//! past the threshold or on the background decay tick, and only through a
//! non-blocking writer checkout. Loss on crash is acceptable.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Pending entries before a flush is requested.
const FLUSH_THRESHOLD: usize = 256;

#[derive(Default)]
pub struct AccessQueue {
    pending: Mutex<HashMap<String, (u32, DateTime<Utc>)>>,
}

impl AccessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one hit per id. Returns true when the queue is due for a flush.
    pub fn record<'a>(&self, ids: impl IntoIterator<Item = &'a str>, now: DateTime<Utc>) -> bool {
        let mut pending = self.pending.lock().expect("access queue mutex poisoned");
        for id in ids {
            let entry = pending.entry(id.to_string()).or_insert((0, now));
            entry.0 += 1;
            entry.1 = now;
        }
        pending.len() >= FLUSH_THRESHOLD
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> HashMap<String, (u32, DateTime<Utc>)> {
        let mut pending = self.pending.lock().expect("access queue mutex poisoned");
        std::mem::take(&mut *pending)
    }

    /// Put a drained batch back after a failed flush, keeping later hits.
    pub fn requeue(&self, batch: HashMap<String, (u32, DateTime<Utc>)>) {
        let mut pending = self.pending.lock().expect("access queue mutex poisoned");
        for (id, (count, at)) in batch {
            let entry = pending.entry(id).or_insert((0, at));
            entry.0 += count;
            entry.1 = entry.1.max(at);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().expect("access queue mutex poisoned").is_empty()
    }
}
