//! Decay subsystem.
//!
//! Four passes in one writer transaction: TTL expiry, per-user quota
//! eviction, low-importance sweep (counted into `memories_expired`), and
//! optional content compression. The pass sequence checks a cancellation
//! probe at each boundary; a cancelled run rolls back so no partial state
//! escapes. [`analyze`] computes the same selections read-only.

use std::time::Instant;

use chrono::Utc;

use crate::db::{Deadline, Storage};
use crate::error::Result;
use crate::memory::types::{DecayPlan, DecayPolicy, DecayStats};
use crate::memory::{recall, store};

/// Run a full decay pass. `cancelled` is probed between passes.
pub fn run(
    storage: &Storage,
    policy: &DecayPolicy,
    cancelled: &dyn Fn() -> bool,
) -> Result<DecayStats> {
    let started = Instant::now();
    let now = Utc::now();

    let mut conn = storage.writer(&Deadline::standard())?;
    let tx = conn.transaction()?;
    let mut stats = DecayStats::default();

    // Pass 1: TTL expiry
    stats.memories_expired = store::purge_expired(&tx, now)?;
    if cancelled() {
        return abort(tx, started);
    }

    // Pass 2: per-user quota eviction
    stats.memories_evicted = store::evict_over_quota(&tx, policy.max_memories_per_user, now)?;
    if cancelled() {
        return abort(tx, started);
    }

    // Pass 3: old, unimportant, never-recalled rows expire by age
    stats.memories_expired +=
        store::sweep_low_importance(&tx, now, policy.max_age_hours, policy.importance_threshold)?;
    if cancelled() {
        return abort(tx, started);
    }

    // Pass 4: lossy compression, only when the policy allows it
    if policy.compression_enabled {
        stats.memories_compressed = store::compress_aged(&tx, now)?;
    }

    tx.commit()?;
    stats.elapsed_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        expired = stats.memories_expired,
        evicted = stats.memories_evicted,
        compressed = stats.memories_compressed,
        elapsed_ms = stats.elapsed_ms,
        "decay pass complete"
    );
    Ok(stats)
}

fn abort(tx: rusqlite::Transaction<'_>, started: Instant) -> Result<DecayStats> {
    tx.rollback()?;
    tracing::info!("decay pass cancelled, rolled back");
    Ok(DecayStats {
        elapsed_ms: started.elapsed().as_millis() as u64,
        ..Default::default()
    })
}

/// Report what [`run`] would remove, without mutating anything.
pub fn analyze(storage: &Storage, policy: &DecayPolicy) -> Result<DecayPlan> {
    let now = Utc::now();
    let conn = storage.reader(&Deadline::standard())?;

    let would_expire = recall::count_expired(&conn, now)?
        + recall::count_sweepable(&conn, now, policy.max_age_hours, policy.importance_threshold)?;
    let would_evict = recall::count_over_quota(&conn, policy.max_memories_per_user)?;
    let would_compress = if policy.compression_enabled {
        recall::count_compressible(&conn, now)?
    } else {
        0
    };

    Ok(DecayPlan {
        would_expire,
        would_evict,
        would_compress,
    })
}
