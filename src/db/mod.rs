//! Storage driver: pooled SQLite access for the memex engine.
//!
//! One [`Storage`] per engine instance, holding two r2d2 pools over the same
//! database file: a single-connection writer pool (writes are globally
//! ordered, which keeps WAL contention away) and a multi-connection reader
//! pool. Schema and migrations are applied on open, followed by a
//! `quick_check`.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::config::MemexConfig;
use crate::error::{Error, Result};

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Default per-operation deadline.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Absolute point in time by which an operation must finish.
///
/// The remaining budget is threaded into every pool acquire; a spent deadline
/// yields `Timeout`, an acquire that exhausts the remaining budget yields
/// `Busy`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    /// Deadline for a standard public operation (30 s from now).
    pub fn standard() -> Self {
        Self::after(DEFAULT_OP_TIMEOUT)
    }

    pub fn after(budget: Duration) -> Self {
        Deadline(Instant::now() + budget)
    }

    /// Time left before the deadline, or `None` if it already passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.checked_duration_since(Instant::now())
    }
}

pub struct Storage {
    writers: Pool<SqliteConnectionManager>,
    readers: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Storage {
    /// Open (or create) the database at the configured path, apply schema and
    /// migrations, and build both connection pools.
    pub fn open(config: &MemexConfig) -> Result<Self> {
        let path = PathBuf::from(&config.database_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Io(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let writers = build_pool(&path, config, 1)?;
        let readers = build_pool(&path, config, config.max_readers)?;

        {
            let conn = writers.get()?;
            schema::init_schema(&conn)?;
            migrations::run_migrations(&conn)?;

            let integrity: String =
                conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
            if integrity != "ok" {
                return Err(Error::Corrupt(format!(
                    "integrity check failed on open: {integrity}"
                )));
            }
        }

        tracing::info!(
            path = %path.display(),
            readers = config.max_readers,
            "storage initialized"
        );

        Ok(Self {
            writers,
            readers,
            path,
        })
    }

    /// Acquire the writer connection, waiting at most until `deadline`.
    pub fn writer(&self, deadline: &Deadline) -> Result<PooledConn> {
        acquire(&self.writers, deadline)
    }

    /// Acquire a reader connection, waiting at most until `deadline`.
    pub fn reader(&self, deadline: &Deadline) -> Result<PooledConn> {
        acquire(&self.readers, deadline)
    }

    /// Grab the writer connection only if it is idle right now.
    ///
    /// Used by best-effort work (access bookkeeping) that must never wait
    /// behind a foreground write.
    pub fn try_writer(&self) -> Option<PooledConn> {
        self.writers.try_get()
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a full integrity and version check.
    pub fn health(&self) -> Result<HealthReport> {
        let conn = self.reader(&Deadline::standard())?;

        let schema_version = migrations::get_schema_version(&conn)?;
        let integrity_details: String =
            conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        let integrity_ok = integrity_details == "ok";

        let memory_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        let session_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;

        Ok(HealthReport {
            schema_version,
            integrity_ok,
            integrity_details,
            memory_count,
            session_count,
        })
    }
}

/// Result of a full database health check.
#[derive(Debug)]
pub struct HealthReport {
    pub schema_version: u32,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub memory_count: i64,
    pub session_count: i64,
}

fn build_pool(
    path: &Path,
    config: &MemexConfig,
    size: u32,
) -> Result<Pool<SqliteConnectionManager>> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let cache_size = config.cache_size_kib as i64;
    let busy_timeout = config.busy_timeout_ms;

    let manager = SqliteConnectionManager::file(path)
        .with_flags(flags)
        .with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA cache_size = -{cache_size};
                 PRAGMA busy_timeout = {busy_timeout};
                 PRAGMA foreign_keys = ON;
                 PRAGMA temp_store = memory;"
            ))?;
            Ok(())
        });

    Pool::builder()
        .max_size(size)
        .build(manager)
        .map_err(|e| Error::Io(format!("failed to build connection pool: {e}")))
}

fn acquire(pool: &Pool<SqliteConnectionManager>, deadline: &Deadline) -> Result<PooledConn> {
    let Some(remaining) = deadline.remaining() else {
        return Err(Error::Timeout);
    };
    pool.get_timeout(remaining).map_err(|_| Error::Busy)
}
