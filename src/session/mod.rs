//! Session repository.
//!
//! A session groups one user's memories. Rows are created explicitly or
//! implicitly on first save; the `memory_count` and `aggregate_importance`
//! counters are never stored, they are computed on demand against live
//! (non-expired) memories.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::{parse_ts, ts};
use crate::memory::types::Page;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Live memories in this session, computed on demand.
    pub memory_count: i64,
    /// Sum of live memory importance, computed on demand.
    pub aggregate_importance: f64,
}

const SESSION_COLUMNS: &str = "s.id, s.user_id, s.name, s.metadata, s.created_at, s.updated_at, \
     s.last_activity_at, COALESCE(m.n, 0) AS memory_count, \
     COALESCE(m.total_importance, 0.0) AS aggregate_importance";

/// Aggregate join used by every session read; `?1` binds the current instant
/// so expired memories never count.
const SESSION_AGGREGATE_JOIN: &str = "LEFT JOIN (SELECT session_id, COUNT(*) AS n, SUM(importance) AS total_importance \
                FROM memories WHERE expires_at IS NULL OR expires_at > ?1 \
                GROUP BY session_id) m ON m.session_id = s.id";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let metadata_raw: String = row.get(3)?;
    let created_raw: String = row.get(4)?;
    let updated_raw: String = row.get(5)?;
    let activity_raw: String = row.get(6)?;

    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
        created_at: parse_ts(4, created_raw)?,
        updated_at: parse_ts(5, updated_raw)?,
        last_activity_at: parse_ts(6, activity_raw)?,
        memory_count: row.get(7)?,
        aggregate_importance: row.get(8)?,
    })
}

/// Create a session row with a fresh id.
pub fn create(
    conn: &Connection,
    user_id: &str,
    name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO sessions (id, user_id, name, metadata, created_at, updated_at, last_activity_at) \
         VALUES (?1, ?2, ?3, '{}', ?4, ?4, ?4)",
        params![id, user_id, name, ts(now)],
    )?;
    tracing::debug!(session = %id, user = user_id, "session created");
    Ok(id)
}

/// Make sure `session_id` exists and belongs to `user_id`, creating it on
/// first use (implicit creation on save) and bumping its activity either way.
pub fn ensure(
    conn: &Connection,
    session_id: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT user_id FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;

    match owner {
        Some(owner) if owner == user_id => {
            conn.execute(
                "UPDATE sessions SET last_activity_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![session_id, ts(now)],
            )?;
            Ok(())
        }
        Some(owner) => Err(Error::Invalid(format!(
            "session {session_id} belongs to user {owner}"
        ))),
        None => {
            conn.execute(
                "INSERT INTO sessions (id, user_id, metadata, created_at, updated_at, last_activity_at) \
                 VALUES (?1, ?2, '{}', ?3, ?3, ?3)",
                params![session_id, user_id, ts(now)],
            )?;
            Ok(())
        }
    }
}

/// Fetch one session with its derived counters.
pub fn get(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions s {SESSION_AGGREGATE_JOIN} WHERE s.id = ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![ts(now), id])?;
    match rows.next()? {
        Some(row) => Ok(Some(session_from_row(row)?)),
        None => Ok(None),
    }
}

/// One user's sessions ordered by recency of activity.
pub fn list_by_user(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
    limit: u32,
    offset: u32,
) -> Result<Page<Session>> {
    let total_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions s {SESSION_AGGREGATE_JOIN} \
         WHERE s.user_id = ?2 \
         ORDER BY s.last_activity_at DESC, s.id LIMIT ?3 OFFSET ?4"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut data = stmt
        .query_map(
            params![ts(now), user_id, limit as i64 + 1, offset as i64],
            session_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let has_next = data.len() > limit as usize;
    data.truncate(limit as usize);

    let per_page = limit as usize;
    Ok(Page {
        data,
        total_count,
        page: offset as usize / per_page,
        per_page,
        total_pages: (total_count as usize).div_ceil(per_page),
        has_next,
        has_prev: offset > 0,
    })
}

/// Sessions of `user_id` containing at least one memory whose FTS entry
/// matches `keywords`. Ordered by recency of activity.
pub fn search(
    conn: &Connection,
    user_id: &str,
    keywords: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<Session>> {
    if keywords.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions s {SESSION_AGGREGATE_JOIN} \
         WHERE s.user_id = ?2 AND s.id IN (\
             SELECT memories.session_id FROM memories \
             WHERE memories.rowid IN \
                   (SELECT rowid FROM memories_fts WHERE memories_fts MATCH ?3)) \
         ORDER BY s.last_activity_at DESC, s.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let sessions = stmt
        .query_map(
            params![ts(now), user_id, keywords.join(" ")],
            session_from_row,
        )
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(_, Some(ref message)) if message.contains("fts5") => {
                Error::Invalid(format!("bad keyword expression: {message}"))
            }
            other => other.into(),
        })?;
    Ok(sessions)
}

/// Delete a session. With `cascade_memories` the session's memories go in the
/// same transaction; without it a non-empty session is refused so no memory
/// is ever left pointing at a missing session.
pub fn delete(conn: &Connection, id: &str, cascade_memories: bool) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Ok(false);
    }

    let memory_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE session_id = ?1",
        params![id],
        |row| row.get(0),
    )?;

    if cascade_memories {
        let deleted = conn.execute("DELETE FROM memories WHERE session_id = ?1", params![id])?;
        tracing::info!(session = id, memories = deleted, "cascade session delete");
    } else if memory_count > 0 {
        return Err(Error::Invalid(format!(
            "session {id} still holds {memory_count} memories; pass delete_memories=true"
        )));
    }

    conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store;
    use crate::memory::types::MemoryDraft;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        crate::db::migrations::run_migrations(&conn).unwrap();
        conn
    }

    fn add_memory(conn: &Connection, user: &str, session: &str, content: &str, importance: f64) {
        ensure(conn, session, user, Utc::now()).unwrap();
        let mut draft = MemoryDraft::new(user, session, content);
        draft.importance = importance;
        store::insert(conn, &draft.into_memory(Utc::now()).unwrap()).unwrap();
    }

    #[test]
    fn create_and_get() {
        let conn = test_db();
        let id = create(&conn, "alice", Some("project planning"), Utc::now()).unwrap();

        let session = get(&conn, &id, Utc::now()).unwrap().unwrap();
        assert_eq!(session.user_id, "alice");
        assert_eq!(session.name.as_deref(), Some("project planning"));
        assert_eq!(session.memory_count, 0);
        assert_eq!(session.aggregate_importance, 0.0);
    }

    #[test]
    fn ensure_creates_then_touches() {
        let conn = test_db();
        let t0 = Utc::now();
        ensure(&conn, "s1", "alice", t0).unwrap();

        let t1 = t0 + chrono::Duration::seconds(30);
        ensure(&conn, "s1", "alice", t1).unwrap();

        let session = get(&conn, "s1", Utc::now()).unwrap().unwrap();
        assert_eq!(session.created_at, t0);
        assert_eq!(session.last_activity_at, t1);
    }

    #[test]
    fn ensure_rejects_foreign_session() {
        let conn = test_db();
        ensure(&conn, "s1", "alice", Utc::now()).unwrap();
        let err = ensure(&conn, "s1", "bob", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "Invalid");
    }

    #[test]
    fn derived_counters_track_live_memories() {
        let conn = test_db();
        add_memory(&conn, "alice", "s1", "first note", 0.8);
        add_memory(&conn, "alice", "s1", "second note", 0.4);

        let session = get(&conn, "s1", Utc::now()).unwrap().unwrap();
        assert_eq!(session.memory_count, 2);
        assert!((session.aggregate_importance - 1.2).abs() < 1e-9);

        // expired memories drop out of the counters
        conn.execute(
            "UPDATE memories SET expires_at = ?1",
            params![ts(Utc::now() - chrono::Duration::hours(1))],
        )
        .unwrap();
        let session = get(&conn, "s1", Utc::now()).unwrap().unwrap();
        assert_eq!(session.memory_count, 0);
    }

    #[test]
    fn list_orders_by_activity() {
        let conn = test_db();
        let t0 = Utc::now() - chrono::Duration::hours(3);
        ensure(&conn, "older", "alice", t0).unwrap();
        ensure(&conn, "newer", "alice", t0 + chrono::Duration::hours(1)).unwrap();
        ensure(&conn, "other-user", "bob", Utc::now()).unwrap();

        let page = list_by_user(&conn, "alice", Utc::now(), 10, 0).unwrap();
        assert_eq!(page.total_count, 2);
        let ids: Vec<&str> = page.data.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
    }

    #[test]
    fn list_paginates_with_probe() {
        let conn = test_db();
        for i in 0..5 {
            ensure(
                &conn,
                &format!("s{i}"),
                "alice",
                Utc::now() - chrono::Duration::minutes(i),
            )
            .unwrap();
        }

        let page = list_by_user(&conn, "alice", Utc::now(), 2, 0).unwrap();
        assert_eq!(page.data.len(), 2);
        assert!(page.has_next);
        assert_eq!(page.total_pages, 3);

        let last = list_by_user(&conn, "alice", Utc::now(), 2, 4).unwrap();
        assert_eq!(last.data.len(), 1);
        assert!(!last.has_next);
        assert!(last.has_prev);
    }

    #[test]
    fn search_finds_sessions_by_memory_content() {
        let conn = test_db();
        add_memory(&conn, "alice", "work", "Quarterly revenue projections", 0.7);
        add_memory(&conn, "alice", "hobby", "Sourdough starter feeding schedule", 0.4);
        add_memory(&conn, "bob", "work-bob", "Revenue dashboards for the board", 0.6);

        let found = search(&conn, "alice", &["revenue".into()], Utc::now()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "work");

        let none = search(&conn, "alice", &[], Utc::now()).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn delete_cascade_removes_memories() {
        let conn = test_db();
        for i in 0..5 {
            add_memory(&conn, "alice", "s1", &format!("note {i}"), 0.5);
        }

        assert!(delete(&conn, "s1", true).unwrap());
        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories WHERE session_id = 's1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(get(&conn, "s1", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn delete_without_cascade_refuses_non_empty() {
        let conn = test_db();
        add_memory(&conn, "alice", "s1", "still here", 0.5);

        let err = delete(&conn, "s1", false).unwrap_err();
        assert_eq!(err.kind(), "Invalid");
        assert!(get(&conn, "s1", Utc::now()).unwrap().is_some());
    }

    #[test]
    fn delete_empty_session_without_cascade() {
        let conn = test_db();
        ensure(&conn, "s1", "alice", Utc::now()).unwrap();
        assert!(delete(&conn, "s1", false).unwrap());
        assert!(!delete(&conn, "s1", false).unwrap());
    }
}
