//! The memex engine: validation, guards, orchestration, public operations.
//!
//! [`Memex`] composes the repositories into the operation surface the REST
//! and FFI layers call. It owns the storage pools, the per-user rate gate,
//! the access-bookkeeping queue, the runtime decay policy, and (when
//! enabled) the background decay timer. All operations are blocking; any
//! asynchrony belongs to the layers above.

pub mod access;
pub mod decay;
pub mod limits;
pub mod summary;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::config::MemexConfig;
use crate::db::{Deadline, HealthReport, Storage};
use crate::error::{Error, Result};
use crate::memory::types::{
    BatchResponse, DecayPlan, DecayPolicy, DecayStats, Memory, MemoryDraft, MemoryPatch, Page,
    QueryFilter,
};
use crate::memory::{recall, store, types};
use crate::session::{self, Session};
use crate::stats::{self, SessionAnalytics, StoreStats, UserStats};
use access::AccessQueue;
use limits::RateGate;
use summary::SessionDigest;

/// Token cost of a plain mutating operation.
const COST_MUTATION: u32 = 1;
/// Token cost of a session delete (may cascade over many rows).
const COST_SESSION_DELETE: u32 = 5;
/// Token cost of an on-demand decay pass.
const COST_DECAY: u32 = 10;
/// Bucket key for engine-level work that has no caller user id.
const SYSTEM_BUCKET: &str = "__system__";
/// Rows exported per page while streaming a user's memories.
const EXPORT_PAGE_SIZE: u32 = 1000;

pub(crate) struct Inner {
    config: MemexConfig,
    storage: Storage,
    policy: RwLock<DecayPolicy>,
    gate: RateGate,
    access: AccessQueue,
    valid: AtomicBool,
}

impl Inner {
    /// Flush queued access bookkeeping through a non-blocking writer
    /// checkout. Never waits; a busy writer just requeues the batch.
    fn flush_access(&self) {
        let batch = self.access.drain();
        if batch.is_empty() {
            return;
        }
        match self.storage.try_writer() {
            Some(conn) => {
                if let Err(e) = store::mark_accessed(&conn, &batch) {
                    tracing::warn!(error = %e, "access bookkeeping flush failed");
                    self.access.requeue(batch);
                }
            }
            None => self.access.requeue(batch),
        }
    }

    fn quota(&self) -> u64 {
        self.policy
            .read()
            .expect("policy lock poisoned")
            .max_memories_per_user as u64
    }

    /// Insert one validated draft inside the caller's transaction: implicit
    /// session creation, in-transaction quota check (with optional
    /// auto-eviction), then the row insert.
    fn save_row(
        &self,
        tx: &rusqlite::Transaction<'_>,
        draft: MemoryDraft,
        now: chrono::DateTime<Utc>,
    ) -> Result<String> {
        let memory = draft.into_memory(now)?;
        session::ensure(tx, &memory.session_id, &memory.user_id, now)?;

        let count = recall::count_by_user(tx, &memory.user_id)?;
        let max = self.quota();
        if count >= max {
            if self.config.auto_evict_enabled {
                let need = count + 1 - max;
                store::evict_for_user(tx, &memory.user_id, need, now)?;
            } else {
                return Err(Error::QuotaExceeded {
                    current: count,
                    max,
                });
            }
        }

        store::insert(tx, &memory)?;
        Ok(memory.id)
    }
}

struct DecayWorker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl DecayWorker {
    fn spawn(inner: Weak<Inner>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_thread = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("memex-decay".into())
            .spawn(move || loop {
                let (lock, cvar) = &*stop_for_thread;
                let stopped = lock.lock().expect("decay stop lock poisoned");
                let (stopped, _) = cvar
                    .wait_timeout_while(stopped, interval, |stop| !*stop)
                    .expect("decay stop lock poisoned");
                if *stopped {
                    break;
                }
                drop(stopped);

                let Some(inner) = inner.upgrade() else { break };
                if !inner.valid.load(Ordering::Acquire) {
                    break;
                }

                inner.flush_access();
                let policy = inner.policy.read().expect("policy lock poisoned").clone();
                let probe_stop = Arc::clone(&stop_for_thread);
                let cancelled =
                    move || *probe_stop.0.lock().expect("decay stop lock poisoned");
                match decay::run(&inner.storage, &policy, &cancelled) {
                    Ok(_) => {}
                    Err(Error::Corrupt(message)) => {
                        tracing::error!(%message, "corruption during scheduled decay");
                        inner.valid.store(false, Ordering::Release);
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "scheduled decay failed"),
                }
            })
            .expect("failed to spawn decay thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

/// A memex engine instance over one database file.
pub struct Memex {
    inner: Arc<Inner>,
    decay_worker: Option<DecayWorker>,
}

impl Memex {
    /// Build an engine from a validated configuration.
    pub fn new(config: MemexConfig) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(&config)?;

        let policy = DecayPolicy {
            max_age_hours: config.default_memory_ttl_hours,
            importance_threshold: config.importance_threshold,
            max_memories_per_user: config.max_memories_per_user,
            compression_enabled: config.enable_compression,
        };

        let inner = Arc::new(Inner {
            gate: RateGate::new(&config),
            access: AccessQueue::new(),
            policy: RwLock::new(policy),
            valid: AtomicBool::new(true),
            storage,
            config,
        });

        let decay_worker = if inner.config.auto_decay_enabled {
            let interval =
                Duration::from_secs(inner.config.decay_interval_hours as u64 * 3600);
            Some(DecayWorker::spawn(Arc::downgrade(&inner), interval))
        } else {
            None
        };

        Ok(Self {
            inner,
            decay_worker,
        })
    }

    /// Build an engine from a JSON config document.
    pub fn from_json(config_json: &str) -> Result<Self> {
        Self::new(MemexConfig::from_json(config_json)?)
    }

    pub fn config(&self) -> &MemexConfig {
        &self.inner.config
    }

    /// False once storage corruption has been detected; every subsequent
    /// operation fails with `Corrupt`.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    fn run<T>(&self, f: impl FnOnce(&Inner) -> Result<T>) -> Result<T> {
        if !self.is_valid() {
            return Err(Error::Corrupt(
                "engine disabled after storage corruption".into(),
            ));
        }
        let result = f(&self.inner);
        if let Err(Error::Corrupt(ref message)) = result {
            tracing::error!(%message, "storage corruption detected; handle poisoned");
            self.inner.valid.store(false, Ordering::Release);
        }
        result
    }

    // ── Memory operations ─────────────────────────────────────────────────

    /// Validate and store one memory. Returns the new id.
    pub fn save(&self, draft: MemoryDraft) -> Result<String> {
        self.run(|inner| {
            types::validate_identifier("user_id", &draft.user_id)?;
            inner.gate.check(&draft.user_id, COST_MUTATION)?;

            let now = Utc::now();
            let mut conn = inner.storage.writer(&Deadline::standard())?;
            let tx = conn.transaction()?;
            let id = inner.save_row(&tx, draft, now)?;
            tx.commit()?;

            tracing::debug!(memory = %id, "memory saved");
            Ok(id)
        })
    }

    /// Store many drafts.
    ///
    /// `fail_on_error=true` runs the whole batch in one transaction and rolls
    /// everything back on the first error; the response carries the offending
    /// index. `fail_on_error=false` splits the batch into sub-transactions of
    /// `max_batch_size` rows, collecting per-row outcomes; an infrastructure
    /// error aborts only the current sub-transaction.
    pub fn save_batch(
        &self,
        drafts: Vec<MemoryDraft>,
        fail_on_error: bool,
    ) -> Result<BatchResponse> {
        self.run(|inner| {
            let mut response = BatchResponse::default();
            if drafts.is_empty() {
                return Ok(response);
            }

            let max_batch = inner.config.max_batch_size as usize;
            if fail_on_error && drafts.len() > max_batch {
                return Err(Error::Invalid(format!(
                    "atomic batch of {} exceeds max_batch_size {max_batch}",
                    drafts.len()
                )));
            }

            // Charge the gate up front, one weighted check per distinct user
            let mut rows_per_user: HashMap<&str, usize> = HashMap::new();
            for draft in &drafts {
                *rows_per_user.entry(draft.user_id.as_str()).or_insert(0) += 1;
            }
            for (user, rows) in rows_per_user {
                inner.gate.check(user, ((rows + 9) / 10).max(1) as u32)?;
            }

            let now = Utc::now();
            let mut conn = inner.storage.writer(&Deadline::standard())?;

            if fail_on_error {
                let tx = conn.transaction()?;
                let mut ids = Vec::with_capacity(drafts.len());
                for (index, draft) in drafts.into_iter().enumerate() {
                    match inner.save_row(&tx, draft, now) {
                        Ok(id) => ids.push((index, id)),
                        Err(e) if is_row_error(&e) => {
                            tx.rollback()?;
                            response.push_error(index, &e);
                            tracing::info!(index, "atomic batch rolled back");
                            return Ok(response);
                        }
                        Err(e) => {
                            tx.rollback()?;
                            return Err(e);
                        }
                    }
                }
                tx.commit()?;
                for (index, id) in ids {
                    response.push_ok(index, id);
                }
                return Ok(response);
            }

            let drafts: Vec<(usize, MemoryDraft)> = drafts.into_iter().enumerate().collect();
            'chunks: for chunk in drafts.chunks(max_batch) {
                let tx = match conn.transaction() {
                    Ok(tx) => tx,
                    Err(e) => {
                        let err = Error::from(e);
                        for (index, _) in chunk {
                            response.push_error(*index, &err);
                        }
                        continue;
                    }
                };

                let mut pending: Vec<(usize, String)> = Vec::new();
                for (index, draft) in chunk {
                    match inner.save_row(&tx, draft.clone(), now) {
                        Ok(id) => pending.push((*index, id)),
                        Err(e) if is_row_error(&e) => response.push_error(*index, &e),
                        Err(e) => {
                            // Infrastructure failure: the sub-transaction is
                            // lost, including its previously accepted rows.
                            for (ok_index, _) in &pending {
                                response.push_error(*ok_index, &e);
                            }
                            response.push_error(*index, &e);
                            let _ = tx.rollback();
                            continue 'chunks;
                        }
                    }
                }

                match tx.commit() {
                    Ok(()) => {
                        for (index, id) in pending {
                            response.push_ok(index, id);
                        }
                    }
                    Err(e) => {
                        let err = Error::from(e);
                        for (index, _) in pending {
                            response.push_error(index, &err);
                        }
                    }
                }
            }

            tracing::info!(
                ok = response.success_count,
                failed = response.failure_count,
                "batch save complete"
            );
            Ok(response)
        })
    }

    /// Filtered, paginated recall. Access bookkeeping for the returned rows
    /// is queued and flushed best-effort; it never blocks the read.
    pub fn recall(&self, filter: QueryFilter) -> Result<Page<Memory>> {
        self.run(|inner| {
            let (limit, offset) = filter.validate()?;
            let now = Utc::now();

            let page = {
                let conn = inner.storage.reader(&Deadline::standard())?;
                recall::list_by_filter(&conn, &filter, now, limit, offset)?
            };

            if inner
                .access
                .record(page.data.iter().map(|m| m.id.as_str()), now)
            {
                inner.flush_access();
            }
            Ok(page)
        })
    }

    /// Keyword search scoped to one user; a thin wrapper over [`recall`].
    pub fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Page<Memory>> {
        if query.trim().is_empty() {
            return Ok(Page::empty(limit.max(1)));
        }
        self.recall(QueryFilter {
            user_id: Some(user_id.to_string()),
            keywords: vec![query.to_string()],
            limit: Some(limit),
            offset: Some(offset),
            ..Default::default()
        })
    }

    /// Fetch one memory by id.
    pub fn get_memory(&self, id: &str) -> Result<Memory> {
        self.run(|inner| {
            let conn = inner.storage.reader(&Deadline::standard())?;
            recall::get(&conn, id, Utc::now())?
                .ok_or_else(|| Error::NotFound(format!("memory {id}")))
        })
    }

    /// Apply a partial update. Returns false for an unknown id.
    pub fn update_memory(&self, id: &str, patch: MemoryPatch) -> Result<bool> {
        self.run(|inner| {
            let now = Utc::now();
            let mut conn = inner.storage.writer(&Deadline::standard())?;
            let tx = conn.transaction()?;

            let Some(mut memory) = recall::get(&tx, id, now)? else {
                return Ok(false);
            };
            inner.gate.check(&memory.user_id, COST_MUTATION)?;

            patch.apply(&mut memory, now)?;
            store::update(&tx, &memory)?;
            session::ensure(&tx, &memory.session_id, &memory.user_id, now)?;
            tx.commit()?;

            tracing::debug!(memory = %id, "memory updated");
            Ok(true)
        })
    }

    /// Delete one memory. Returns false for an unknown id.
    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        self.run(|inner| {
            let conn = inner.storage.writer(&Deadline::standard())?;
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM memories WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(owner) = owner else {
                return Ok(false);
            };
            inner.gate.check(&owner, COST_MUTATION)?;
            store::delete(&conn, id)
        })
    }

    /// Export every live memory of one user, paging internally.
    pub fn export_user_memories(&self, user_id: &str) -> Result<Vec<Memory>> {
        self.run(|inner| {
            let now = Utc::now();
            let conn = inner.storage.reader(&Deadline::standard())?;
            let filter = QueryFilter::for_user(user_id);

            let mut all = Vec::new();
            let mut offset = 0;
            loop {
                let page =
                    recall::list_by_filter(&conn, &filter, now, EXPORT_PAGE_SIZE, offset)?;
                let has_next = page.has_next;
                all.extend(page.data);
                if !has_next {
                    break;
                }
                offset += EXPORT_PAGE_SIZE;
            }

            tracing::info!(user = user_id, count = all.len(), "exported memories");
            Ok(all)
        })
    }

    // ── Session operations ────────────────────────────────────────────────

    pub fn create_session(&self, user_id: &str, name: Option<&str>) -> Result<String> {
        self.run(|inner| {
            types::validate_identifier("user_id", user_id)?;
            inner.gate.check(user_id, COST_MUTATION)?;

            let conn = inner.storage.writer(&Deadline::standard())?;
            session::create(&conn, user_id, name, Utc::now())
        })
    }

    pub fn get_user_sessions(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Page<Session>> {
        self.run(|inner| {
            if limit == 0 || limit > types::MAX_PAGE_SIZE {
                return Err(Error::Invalid(format!(
                    "limit must be in 1..={}, got {limit}",
                    types::MAX_PAGE_SIZE
                )));
            }
            let conn = inner.storage.reader(&Deadline::standard())?;
            session::list_by_user(&conn, user_id, Utc::now(), limit, offset)
        })
    }

    /// Digest one session's live memories. `None` when the session is empty.
    pub fn summarize_session(&self, session_id: &str) -> Result<Option<SessionDigest>> {
        self.run(|inner| {
            let conn = inner.storage.reader(&Deadline::standard())?;
            summary::summarize(&conn, session_id, Utc::now())
        })
    }

    /// Sessions of `user_id` whose memories match the keywords.
    pub fn search_sessions(&self, user_id: &str, keywords: &[String]) -> Result<Vec<Session>> {
        self.run(|inner| {
            let conn = inner.storage.reader(&Deadline::standard())?;
            session::search(&conn, user_id, keywords, Utc::now())
        })
    }

    /// Delete a session, optionally cascading over its memories. Returns
    /// false for an unknown id.
    pub fn delete_session(&self, session_id: &str, delete_memories: bool) -> Result<bool> {
        self.run(|inner| {
            let mut conn = inner.storage.writer(&Deadline::standard())?;
            let tx = conn.transaction()?;

            let owner: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM sessions WHERE id = ?1",
                    rusqlite::params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(owner) = owner else {
                return Ok(false);
            };
            inner.gate.check(&owner, COST_SESSION_DELETE)?;

            let deleted = session::delete(&tx, session_id, delete_memories)?;
            tx.commit()?;
            Ok(deleted)
        })
    }

    // ── Decay operations ──────────────────────────────────────────────────

    /// Run a decay pass now. Decay mutates across every user, so it charges
    /// the system bucket; queued access bookkeeping flushes first so the
    /// sweep sees up-to-date counters.
    pub fn decay(&self) -> Result<DecayStats> {
        self.run(|inner| {
            inner.gate.check(SYSTEM_BUCKET, COST_DECAY)?;
            inner.flush_access();
            let policy = inner.policy.read().expect("policy lock poisoned").clone();
            decay::run(&inner.storage, &policy, &|| false)
        })
    }

    /// Report what a decay pass would remove, without mutating.
    pub fn analyze_decay(&self) -> Result<DecayPlan> {
        self.run(|inner| {
            let policy = inner.policy.read().expect("policy lock poisoned").clone();
            decay::analyze(&inner.storage, &policy)
        })
    }

    /// Swap the runtime decay policy.
    pub fn update_decay_policy(&self, policy: DecayPolicy) -> Result<()> {
        self.run(|inner| {
            policy.validate()?;
            *inner.policy.write().expect("policy lock poisoned") = policy;
            tracing::info!("decay policy updated");
            Ok(())
        })
    }

    pub fn decay_policy(&self) -> DecayPolicy {
        self.inner
            .policy
            .read()
            .expect("policy lock poisoned")
            .clone()
    }

    // ── Statistics ────────────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<StoreStats> {
        self.run(|inner| {
            let conn = inner.storage.reader(&Deadline::standard())?;
            stats::store_stats(&conn, Utc::now(), inner.storage.path())
        })
    }

    pub fn get_user_stats(&self, user_id: &str) -> Result<UserStats> {
        self.run(|inner| {
            let conn = inner.storage.reader(&Deadline::standard())?;
            stats::user_stats(&conn, user_id, Utc::now())
        })
    }

    pub fn get_session_analytics(&self, user_id: &str) -> Result<SessionAnalytics> {
        self.run(|inner| {
            let conn = inner.storage.reader(&Deadline::standard())?;
            stats::session_analytics(&conn, user_id, Utc::now())
        })
    }

    /// Storage health (schema version, integrity, row counts).
    pub fn health(&self) -> Result<HealthReport> {
        self.run(|inner| inner.storage.health())
    }
}

impl Drop for Memex {
    fn drop(&mut self) {
        if let Some(mut worker) = self.decay_worker.take() {
            {
                let (lock, cvar) = &*worker.stop;
                *lock.lock().expect("decay stop lock poisoned") = true;
                cvar.notify_all();
            }
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
        if self.is_valid() {
            self.inner.flush_access();
        }
    }
}

/// Errors that fail one batch row rather than the whole operation.
fn is_row_error(err: &Error) -> bool {
    matches!(err, Error::Invalid(_) | Error::QuotaExceeded { .. })
}
