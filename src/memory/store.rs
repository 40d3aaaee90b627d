//! Memory write path.
//!
//! Row inserts, full-row updates, deletes, the batched access-count flush,
//! and the decay mutations (TTL purge, quota eviction, low-importance sweep,
//! content compression). The FTS index stays consistent through the schema
//! triggers, inside the same transaction as every write.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use super::{excerpt, ts};
use crate::error::Result;
use crate::memory::types::Memory;

/// Rows expiring within this window count as "near expiry" for eviction.
const NEAR_EXPIRY_HOURS: i64 = 24;
/// Compression pass: minimum age of a candidate row.
const COMPRESS_MIN_AGE_DAYS: i64 = 30;
/// Compression pass: importance ceiling of a candidate row.
const COMPRESS_MAX_IMPORTANCE: f64 = 0.5;
/// Compression pass: how much content survives.
const COMPRESS_KEEP_CHARS: usize = 200;

/// Insert a fully materialized memory row.
pub fn insert(conn: &Connection, memory: &Memory) -> Result<()> {
    conn.execute(
        "INSERT INTO memories (id, user_id, session_id, content, importance, created_at, \
         updated_at, expires_at, ttl_hours, metadata, tags, access_count, last_accessed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            memory.id,
            memory.user_id,
            memory.session_id,
            memory.content,
            memory.importance,
            ts(memory.created_at),
            ts(memory.updated_at),
            memory.expires_at.map(ts),
            memory.ttl_hours,
            serde_json::to_string(&memory.metadata)?,
            serde_json::to_string(&memory.tags)?,
            memory.access_count,
            memory.last_accessed_at.map(ts),
        ],
    )?;
    Ok(())
}

/// Rewrite an existing row in place. Returns false if the id is unknown.
///
/// The FTS update trigger re-indexes content and tags.
pub fn update(conn: &Connection, memory: &Memory) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE memories SET content = ?2, importance = ?3, updated_at = ?4, expires_at = ?5, \
         ttl_hours = ?6, metadata = ?7, tags = ?8 WHERE id = ?1",
        params![
            memory.id,
            memory.content,
            memory.importance,
            ts(memory.updated_at),
            memory.expires_at.map(ts),
            memory.ttl_hours,
            serde_json::to_string(&memory.metadata)?,
            serde_json::to_string(&memory.tags)?,
        ],
    )?;
    Ok(rows > 0)
}

/// Delete one memory. Returns false if the id is unknown.
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Apply coalesced access bookkeeping: each entry adds `hits` to
/// `access_count` and advances `last_accessed_at`.
pub fn mark_accessed(
    conn: &Connection,
    hits: &HashMap<String, (u32, DateTime<Utc>)>,
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "UPDATE memories SET access_count = access_count + ?2, last_accessed_at = ?3 \
         WHERE id = ?1",
    )?;
    let mut updated = 0;
    for (id, (count, at)) in hits {
        updated += stmt.execute(params![id, count, ts(*at)])?;
    }
    Ok(updated)
}

/// Decay pass 1: drop every row whose TTL has elapsed.
pub fn purge_expired(conn: &Connection, now: DateTime<Utc>) -> Result<u64> {
    let rows = conn.execute(
        "DELETE FROM memories WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![ts(now)],
    )?;
    Ok(rows as u64)
}

/// Decay pass 2: bring every user back under `max_per_user`.
pub fn evict_over_quota(conn: &Connection, max_per_user: u32, now: DateTime<Utc>) -> Result<u64> {
    let over_quota: Vec<(String, u64)> = {
        let mut stmt = conn.prepare(
            "SELECT user_id, COUNT(*) AS n FROM memories GROUP BY user_id HAVING n > ?1",
        )?;
        let rows = stmt
            .query_map(params![max_per_user], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut evicted = 0;
    for (user_id, count) in over_quota {
        let excess = count - max_per_user as u64;
        evicted += evict_for_user(conn, &user_id, excess, now)?;
    }
    Ok(evicted)
}

/// Evict the `excess` least valuable rows of one user.
///
/// Order: near-expiry rows first, then ascending importance, then ascending
/// `last_accessed_at` (NULL sorts first, so never-recalled rows go before
/// recently used ones), then ascending `created_at`.
pub fn evict_for_user(
    conn: &Connection,
    user_id: &str,
    excess: u64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let near_expiry = ts(now + Duration::hours(NEAR_EXPIRY_HOURS));
    let rows = conn.execute(
        "DELETE FROM memories WHERE id IN (\
             SELECT id FROM memories WHERE user_id = ?1 \
             ORDER BY CASE WHEN expires_at IS NOT NULL AND expires_at <= ?2 THEN 0 ELSE 1 END, \
                      importance ASC, last_accessed_at ASC, created_at ASC \
             LIMIT ?3)",
        params![user_id, near_expiry, excess as i64],
    )?;
    if rows > 0 {
        tracing::debug!(user = user_id, evicted = rows, "quota eviction");
    }
    Ok(rows as u64)
}

/// Decay pass 3: drop old, unimportant, never-recalled rows.
pub fn sweep_low_importance(
    conn: &Connection,
    now: DateTime<Utc>,
    max_age_hours: u32,
    importance_threshold: f64,
) -> Result<u64> {
    let cutoff = ts(now - Duration::hours(max_age_hours as i64));
    let rows = conn.execute(
        "DELETE FROM memories \
         WHERE created_at < ?1 AND importance < ?2 AND access_count = 0",
        params![cutoff, importance_threshold],
    )?;
    Ok(rows as u64)
}

/// Decay pass 4: truncate the content of old, low-importance rows.
///
/// Lossy by policy. The original byte length is preserved in
/// `metadata.original_length`, which also marks the row as already
/// compressed so later passes skip it.
pub fn compress_aged(conn: &Connection, now: DateTime<Utc>) -> Result<u64> {
    let cutoff = ts(now - Duration::days(COMPRESS_MIN_AGE_DAYS));

    let candidates: Vec<(String, String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, content, metadata FROM memories \
             WHERE created_at < ?1 AND importance < ?2 \
               AND json_extract(metadata, '$.original_length') IS NULL",
        )?;
        let rows = stmt
            .query_map(params![cutoff, COMPRESS_MAX_IMPORTANCE], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut compressed = 0;
    for (id, content, metadata_raw) in candidates {
        let keep = excerpt(&content, COMPRESS_KEEP_CHARS);
        if keep.len() == content.len() {
            continue; // already short enough
        }
        let truncated = format!("{keep}…");

        let mut metadata: HashMap<String, serde_json::Value> =
            serde_json::from_str(&metadata_raw).unwrap_or_default();
        metadata.insert("original_length".into(), serde_json::json!(content.len()));

        conn.execute(
            "UPDATE memories SET content = ?2, metadata = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, truncated, serde_json::to_string(&metadata)?, ts(now)],
        )?;
        compressed += 1;
    }
    Ok(compressed)
}
