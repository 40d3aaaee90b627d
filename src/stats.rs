//! Aggregate statistics over memories and sessions.
//!
//! Everything here is computed with single aggregate queries; nothing is
//! cached or stored eagerly. Expired rows are excluded wherever a count
//! describes what a caller could actually recall.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{parse_ts, ts};
use crate::session::{self, Session};

/// Store-wide statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_memories: i64,
    pub active_memories: i64,
    pub expired_memories: i64,
    pub total_users: i64,
    pub total_sessions: i64,
    pub database_size_bytes: u64,
    pub memories_by_user: HashMap<String, i64>,
}

/// Per-user statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStats {
    pub user_id: String,
    pub total_memories: i64,
    pub avg_importance: f64,
    /// Buckets: high (>= 0.8), medium (>= 0.5), low (>= 0.2), very_low.
    pub importance_distribution: HashMap<String, i64>,
    /// Buckets: 24h, 1week, 1month, 1year, older.
    pub age_distribution: HashMap<String, i64>,
    /// Counts per `metadata.category` value; rows without one fall under
    /// `uncategorized`.
    pub category_distribution: HashMap<String, i64>,
    pub oldest_memory: Option<DateTime<Utc>>,
    pub newest_memory: Option<DateTime<Utc>>,
}

/// Per-user session analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnalytics {
    pub user_id: String,
    pub total_sessions: i64,
    pub total_memories: i64,
    pub avg_memories_per_session: f64,
    pub most_active_session: Option<Session>,
    pub most_recent_session: Option<Session>,
    /// Live memory count per `YYYY-MM-DD` creation day.
    pub activity_by_day: HashMap<String, i64>,
}

/// Store-wide statistics; `db_path` is used for the file size.
pub fn store_stats(conn: &Connection, now: DateTime<Utc>, db_path: &Path) -> Result<StoreStats> {
    let now_s = ts(now);

    let total_memories: i64 =
        conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
    let active_memories: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE expires_at IS NULL OR expires_at > ?1",
        params![now_s],
        |row| row.get(0),
    )?;
    let total_users: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT user_id) FROM memories",
        [],
        |row| row.get(0),
    )?;
    let total_sessions: i64 =
        conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;

    let mut memories_by_user = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT user_id, COUNT(*) FROM memories \
         WHERE expires_at IS NULL OR expires_at > ?1 GROUP BY user_id",
    )?;
    let rows = stmt.query_map(params![now_s], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (user, count) = row?;
        memories_by_user.insert(user, count);
    }

    let database_size_bytes = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    Ok(StoreStats {
        total_memories,
        active_memories,
        expired_memories: total_memories - active_memories,
        total_users,
        total_sessions,
        database_size_bytes,
        memories_by_user,
    })
}

/// Per-user statistics over live memories.
pub fn user_stats(conn: &Connection, user_id: &str, now: DateTime<Utc>) -> Result<UserStats> {
    let now_s = ts(now);

    let (total_memories, avg_importance, oldest_raw, newest_raw): (
        i64,
        f64,
        Option<String>,
        Option<String>,
    ) = conn.query_row(
        "SELECT COUNT(*), COALESCE(AVG(importance), 0.0), MIN(created_at), MAX(created_at) \
         FROM memories WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        params![user_id, now_s],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let mut importance_distribution = HashMap::new();
    for bucket in ["high", "medium", "low", "very_low"] {
        importance_distribution.insert(bucket.to_string(), 0);
    }
    let mut stmt = conn.prepare(
        "SELECT CASE \
             WHEN importance >= 0.8 THEN 'high' \
             WHEN importance >= 0.5 THEN 'medium' \
             WHEN importance >= 0.2 THEN 'low' \
             ELSE 'very_low' END AS bucket, COUNT(*) \
         FROM memories WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2) \
         GROUP BY bucket",
    )?;
    let rows = stmt.query_map(params![user_id, now_s], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (bucket, count) = row?;
        importance_distribution.insert(bucket, count);
    }

    let mut age_distribution = HashMap::new();
    for bucket in ["24h", "1week", "1month", "1year", "older"] {
        age_distribution.insert(bucket.to_string(), 0);
    }
    let day = ts(now - Duration::hours(24));
    let week = ts(now - Duration::days(7));
    let month = ts(now - Duration::days(30));
    let year = ts(now - Duration::days(365));
    let mut stmt = conn.prepare(
        "SELECT CASE \
             WHEN created_at >= ?3 THEN '24h' \
             WHEN created_at >= ?4 THEN '1week' \
             WHEN created_at >= ?5 THEN '1month' \
             WHEN created_at >= ?6 THEN '1year' \
             ELSE 'older' END AS bucket, COUNT(*) \
         FROM memories WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2) \
         GROUP BY bucket",
    )?;
    let rows = stmt.query_map(params![user_id, now_s, day, week, month, year], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (bucket, count) = row?;
        age_distribution.insert(bucket, count);
    }

    let mut category_distribution = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT COALESCE(CAST(json_extract(metadata, '$.category') AS TEXT), 'uncategorized'), \
                COUNT(*) \
         FROM memories WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2) \
         GROUP BY 1",
    )?;
    let rows = stmt.query_map(params![user_id, now_s], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (category, count) = row?;
        category_distribution.insert(category, count);
    }

    Ok(UserStats {
        user_id: user_id.to_string(),
        total_memories,
        avg_importance,
        importance_distribution,
        age_distribution,
        category_distribution,
        oldest_memory: oldest_raw.map(|raw| parse_ts(2, raw)).transpose()?,
        newest_memory: newest_raw.map(|raw| parse_ts(3, raw)).transpose()?,
    })
}

/// Session-level analytics for one user.
pub fn session_analytics(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<SessionAnalytics> {
    let now_s = ts(now);

    let total_sessions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    let total_memories: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories \
         WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        params![user_id, now_s],
        |row| row.get(0),
    )?;

    let most_active_id: Option<String> = conn
        .query_row(
            "SELECT session_id FROM memories \
             WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2) \
             GROUP BY session_id ORDER BY COUNT(*) DESC, session_id LIMIT 1",
            params![user_id, now_s],
            |row| row.get(0),
        )
        .optional()?;
    let most_active_session = match most_active_id {
        Some(id) => session::get(conn, &id, now)?,
        None => None,
    };

    let most_recent_id: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE user_id = ?1 \
             ORDER BY last_activity_at DESC, id LIMIT 1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    let most_recent_session = match most_recent_id {
        Some(id) => session::get(conn, &id, now)?,
        None => None,
    };

    let mut activity_by_day = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT substr(created_at, 1, 10) AS day, COUNT(*) FROM memories \
         WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2) \
         GROUP BY day",
    )?;
    let rows = stmt.query_map(params![user_id, now_s], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (day, count) = row?;
        activity_by_day.insert(day, count);
    }

    let avg_memories_per_session = if total_sessions > 0 {
        total_memories as f64 / total_sessions as f64
    } else {
        0.0
    };

    Ok(SessionAnalytics {
        user_id: user_id.to_string(),
        total_sessions,
        total_memories,
        avg_memories_per_session,
        most_active_session,
        most_recent_session,
        activity_by_day,
    })
}
