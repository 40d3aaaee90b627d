//! Memory read path.
//!
//! Point lookup, filtered pagination, per-user counts, and the read-only
//! candidate counts behind `analyze_decay`. Expired rows are invisible to
//! every read; they stay on disk until a decay pass removes them.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};

use super::{parse_ts, ts};
use crate::error::{Error, Result};
use crate::memory::query::{self, MEMORY_COLUMNS};
use crate::memory::types::{Memory, Page, QueryFilter};

/// Map one row of [`MEMORY_COLUMNS`] onto a [`Memory`].
pub(crate) fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let created_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;
    let expires_raw: Option<String> = row.get(7)?;
    let accessed_raw: Option<String> = row.get(12)?;
    let metadata_raw: String = row.get(9)?;
    let tags_raw: String = row.get(10)?;

    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        session_id: row.get(2)?,
        content: row.get(3)?,
        importance: row.get(4)?,
        created_at: parse_ts(5, created_raw)?,
        updated_at: parse_ts(6, updated_raw)?,
        expires_at: expires_raw.map(|raw| parse_ts(7, raw)).transpose()?,
        ttl_hours: row.get(8)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        access_count: row.get(11)?,
        last_accessed_at: accessed_raw.map(|raw| parse_ts(12, raw)).transpose()?,
    })
}

/// Fetch one live memory by id. Expired rows read as absent.
pub fn get(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<Option<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories \
         WHERE memories.id = ?1 AND (memories.expires_at IS NULL OR memories.expires_at > ?2)"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id, ts(now)])?;
    match rows.next()? {
        Some(row) => Ok(Some(memory_from_row(row)?)),
        None => Ok(None),
    }
}

/// Run a validated filter: one COUNT for `total_count`, one page query with a
/// LIMIT+1 probe row for `has_next`.
pub fn list_by_filter(
    conn: &Connection,
    filter: &QueryFilter,
    now: DateTime<Utc>,
    limit: u32,
    offset: u32,
) -> Result<Page<Memory>> {
    let compiled = query::compile(filter, now, limit, offset);

    let total_count: i64 = conn
        .prepare(&compiled.count_sql)?
        .query_row(params_from_iter(compiled.count_params.iter()), |row| {
            row.get(0)
        })
        .map_err(|e| map_query_error(e, compiled.has_keywords))?;

    let mut stmt = conn.prepare(&compiled.select_sql)?;
    let mut data = stmt
        .query_map(params_from_iter(compiled.select_params.iter()), memory_from_row)
        .map_err(|e| map_query_error(e, compiled.has_keywords))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| map_query_error(e, compiled.has_keywords))?;

    let has_next = data.len() > limit as usize;
    data.truncate(limit as usize);

    let per_page = limit as usize;
    let page = offset as usize / per_page;
    let total_pages = (total_count as usize).div_ceil(per_page);

    Ok(Page {
        data,
        total_count,
        page,
        per_page,
        total_pages,
        has_next,
        has_prev: offset > 0,
    })
}

/// Count every stored row of one user, expired or not. The quota is charged
/// on stored rows; eviction drains expired ones first.
pub fn count_by_user(conn: &Connection, user_id: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

// ── Read-only decay candidate counts ──────────────────────────────────────────

pub fn count_expired(conn: &Connection, now: DateTime<Utc>) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![ts(now)],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn count_over_quota(conn: &Connection, max_per_user: u32) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COALESCE(SUM(n - ?1), 0) FROM \
         (SELECT COUNT(*) AS n FROM memories GROUP BY user_id HAVING n > ?1)",
        params![max_per_user],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn count_sweepable(
    conn: &Connection,
    now: DateTime<Utc>,
    max_age_hours: u32,
    importance_threshold: f64,
) -> Result<u64> {
    let cutoff = ts(now - Duration::hours(max_age_hours as i64));
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories \
         WHERE created_at < ?1 AND importance < ?2 AND access_count = 0",
        params![cutoff, importance_threshold],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn count_compressible(conn: &Connection, now: DateTime<Utc>) -> Result<u64> {
    let cutoff = ts(now - Duration::days(30));
    // length() measures bytes; the compression pass re-checks char boundaries
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories \
         WHERE created_at < ?1 AND importance < 0.5 \
           AND json_extract(metadata, '$.original_length') IS NULL \
           AND length(content) > 200",
        params![cutoff],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// A bad FTS5 expression in user keywords is caller error, not storage error.
fn map_query_error(err: rusqlite::Error, has_keywords: bool) -> Error {
    if has_keywords {
        if let rusqlite::Error::SqliteFailure(_, Some(ref message)) = err {
            if message.contains("fts5") {
                return Error::Invalid(format!("bad keyword expression: {message}"));
            }
        }
    }
    err.into()
}
