#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use memex::{Memex, MemexConfig, MemoryDraft};
use rusqlite::{params, Connection};
use tempfile::TempDir;

/// Engine over a fresh temp-file database, with request limits and the
/// background decay timer off so tests control every mutation.
pub fn test_engine() -> (Memex, TempDir) {
    engine_with(|_| {})
}

/// Same as [`test_engine`], with config tweaks applied first.
pub fn engine_with(tweak: impl FnOnce(&mut MemexConfig)) -> (Memex, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = MemexConfig {
        database_path: dir.path().join("memex.db").to_string_lossy().into_owned(),
        enable_request_limits: false,
        auto_decay_enabled: false,
        ..Default::default()
    };
    tweak(&mut config);
    (Memex::new(config).unwrap(), dir)
}

pub fn draft(user: &str, session: &str, content: &str, importance: f64) -> MemoryDraft {
    let mut draft = MemoryDraft::new(user, session, content);
    draft.importance = importance;
    draft
}

/// Second connection onto the engine's database file, for backdating rows.
/// WAL mode lets it coexist with the engine's pools.
pub fn raw_conn(engine: &Memex) -> Connection {
    let conn = Connection::open(&engine.config().database_path).unwrap();
    conn.pragma_update(None, "busy_timeout", 5000).unwrap();
    conn
}

/// Rewrite a memory's creation time, standing in for a movable clock.
pub fn backdate_created(conn: &Connection, id: &str, hours: i64) {
    let then = (Utc::now() - Duration::hours(hours)).to_rfc3339();
    conn.execute(
        "UPDATE memories SET created_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![then, id],
    )
    .unwrap();
}

/// Move a memory's expiry to `hours_from_now` (negative = already elapsed).
pub fn set_expiry(conn: &Connection, id: &str, hours_from_now: i64) {
    let at = (Utc::now() + Duration::hours(hours_from_now)).to_rfc3339();
    conn.execute(
        "UPDATE memories SET expires_at = ?1 WHERE id = ?2",
        params![at, id],
    )
    .unwrap();
}

/// Stored creation time of a memory, parsed back from the row.
pub fn stored_created_at(conn: &Connection, id: &str) -> DateTime<Utc> {
    let raw: String = conn
        .query_row(
            "SELECT created_at FROM memories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .unwrap();
    DateTime::parse_from_rfc3339(&raw)
        .unwrap()
        .with_timezone(&Utc)
}
