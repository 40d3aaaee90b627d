//! Core memory type definitions.
//!
//! Defines [`Memory`] (a stored record), [`MemoryDraft`] (caller input for
//! saves), [`MemoryPatch`] (partial update), [`QueryFilter`] (recall
//! predicate), [`Page`] (pagination envelope), and the batch/decay payloads.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hard cap on memory content, in bytes.
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;
/// Hard cap on serialized metadata, in bytes.
pub const MAX_METADATA_BYTES: usize = 16 * 1024;
/// Longest accepted user/session identifier.
pub const MAX_ID_LEN: usize = 255;
/// Longest accepted TTL (one year).
pub const MAX_TTL_HOURS: i64 = 8760;
/// Page size applied when a filter leaves `limit` unset.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
/// Largest accepted page size.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// A stored memory record, matching the `memories` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    /// Retention/ranking weight in `[0.0, 1.0]`.
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `created_at + ttl_hours` when a TTL is set; persisted for indexing.
    pub expires_at: Option<DateTime<Utc>>,
    pub ttl_hours: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Bumped (best-effort) each time a recall returns this row.
    pub access_count: u32,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Derive `expires_at` from `created_at` and `ttl_hours`.
    pub fn derive_expiry(created_at: DateTime<Utc>, ttl_hours: Option<u32>) -> Option<DateTime<Utc>> {
        ttl_hours.map(|ttl| created_at + Duration::hours(ttl as i64))
    }
}

/// Caller-supplied fields for `save` and `save_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDraft {
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    #[serde(default = "default_importance")]
    pub importance: f64,
    /// Zero or negative means "no TTL".
    #[serde(default)]
    pub ttl_hours: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_importance() -> f64 {
    0.5
}

impl MemoryDraft {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            content: content.into(),
            importance: default_importance(),
            ttl_hours: None,
            metadata: HashMap::new(),
            tags: Vec::new(),
        }
    }

    /// Validate and materialize this draft as a [`Memory`] with a fresh id
    /// and server-assigned timestamps.
    pub fn into_memory(self, now: DateTime<Utc>) -> Result<Memory> {
        validate_identifier("user_id", &self.user_id)?;
        validate_identifier("session_id", &self.session_id)?;
        validate_content(&self.content)?;
        validate_importance(self.importance)?;
        validate_metadata(&self.metadata)?;
        let ttl_hours = normalize_ttl(self.ttl_hours)?;

        Ok(Memory {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: self.user_id,
            session_id: self.session_id,
            content: self.content,
            importance: self.importance,
            created_at: now,
            updated_at: now,
            expires_at: Memory::derive_expiry(now, ttl_hours),
            ttl_hours,
            metadata: self.metadata,
            tags: normalize_tags(self.tags),
            access_count: 0,
            last_accessed_at: None,
        })
    }
}

/// Partial update for an existing memory. Unset fields are left untouched;
/// `ttl_hours` of zero or less clears the TTL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub importance: Option<f64>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub tags: Option<Vec<String>>,
    pub ttl_hours: Option<i64>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.importance.is_none()
            && self.metadata.is_none()
            && self.tags.is_none()
            && self.ttl_hours.is_none()
    }

    /// Apply this patch to a memory, recomputing derived fields.
    pub fn apply(self, memory: &mut Memory, now: DateTime<Utc>) -> Result<()> {
        if let Some(content) = self.content {
            validate_content(&content)?;
            memory.content = content;
        }
        if let Some(importance) = self.importance {
            validate_importance(importance)?;
            memory.importance = importance;
        }
        if let Some(metadata) = self.metadata {
            validate_metadata(&metadata)?;
            memory.metadata = metadata;
        }
        if let Some(tags) = self.tags {
            memory.tags = normalize_tags(tags);
        }
        if let Some(ttl) = self.ttl_hours {
            memory.ttl_hours = normalize_ttl(Some(ttl))?;
            memory.expires_at = Memory::derive_expiry(memory.created_at, memory.ttl_hours);
        }
        // updated_at is monotone non-decreasing even if the wall clock slips
        memory.updated_at = now.max(memory.updated_at);
        Ok(())
    }
}

/// Recall predicate. Absent fields do not constrain the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Free-text terms joined with implicit AND; FTS5 syntax passes through.
    pub keywords: Vec<String>,
    /// Half-open window on `created_at`: `date_from <= created_at < date_to`.
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub min_importance: Option<f64>,
    /// Equality predicates on top-level metadata keys.
    pub metadata: HashMap<String, serde_json::Value>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl QueryFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Check ranges and the date window; returns the effective (limit, offset).
    pub fn validate(&self) -> Result<(u32, u32)> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(Error::Invalid(format!(
                "limit must be in 1..={MAX_PAGE_SIZE}, got {limit}"
            )));
        }
        if let Some(min) = self.min_importance {
            if !(0.0..=1.0).contains(&min) {
                return Err(Error::Invalid(format!(
                    "min_importance must be in [0.0, 1.0], got {min}"
                )));
            }
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from >= to {
                return Err(Error::Invalid(
                    "date_from must be earlier than date_to".into(),
                ));
            }
        }
        Ok((limit, self.offset.unwrap_or(0)))
    }
}

/// Paginated response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    /// Count matching the predicates before pagination.
    pub total_count: i64,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> Page<T> {
    pub fn empty(per_page: u32) -> Self {
        Self {
            data: Vec::new(),
            total_count: 0,
            page: 0,
            per_page: per_page as usize,
            total_pages: 0,
            has_next: false,
            has_prev: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Per-row outcome of a batch save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub index: usize,
    pub status: BatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchError {
    pub kind: String,
    pub message: String,
}

/// Response of `save_batch`: per-row outcomes plus totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<BatchResult>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchResponse {
    pub fn push_ok(&mut self, index: usize, id: String) {
        self.results.push(BatchResult {
            index,
            status: BatchStatus::Ok,
            id: Some(id),
            error: None,
        });
        self.success_count += 1;
    }

    pub fn push_error(&mut self, index: usize, err: &Error) {
        self.results.push(BatchResult {
            index,
            status: BatchStatus::Error,
            id: None,
            error: Some(BatchError {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        });
        self.failure_count += 1;
    }
}

/// Retention policy used by the decay subsystem. Seeded from the engine
/// config; mutable at runtime via `update_decay_policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayPolicy {
    /// Age in hours past which low-importance, never-accessed rows are swept.
    pub max_age_hours: u32,
    pub importance_threshold: f64,
    pub max_memories_per_user: u32,
    pub compression_enabled: bool,
}

impl DecayPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(1..=8760).contains(&self.max_age_hours) {
            return Err(Error::BadConfig("max_age_hours must be in 1..=8760".into()));
        }
        if !(0.0..=1.0).contains(&self.importance_threshold) {
            return Err(Error::BadConfig(
                "importance_threshold must be in [0.0, 1.0]".into(),
            ));
        }
        if !(1..=1_000_000).contains(&self.max_memories_per_user) {
            return Err(Error::BadConfig(
                "max_memories_per_user must be in 1..=1000000".into(),
            ));
        }
        Ok(())
    }
}

/// Mutation counts from one decay pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecayStats {
    pub memories_expired: u64,
    pub memories_evicted: u64,
    pub memories_compressed: u64,
    pub elapsed_ms: u64,
}

/// What a decay pass would do, computed read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecayPlan {
    pub would_expire: u64,
    pub would_evict: u64,
    pub would_compress: u64,
}

// ── Validation helpers ────────────────────────────────────────────────────────

pub(crate) fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Invalid(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(Error::Invalid(format!(
            "{field} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    Ok(())
}

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::Invalid("content must not be empty".into()));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(Error::Invalid(format!(
            "content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(())
}

fn validate_importance(importance: f64) -> Result<()> {
    if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
        return Err(Error::Invalid(format!(
            "importance must be in [0.0, 1.0], got {importance}"
        )));
    }
    Ok(())
}

fn validate_metadata(metadata: &HashMap<String, serde_json::Value>) -> Result<()> {
    if metadata.is_empty() {
        return Ok(());
    }
    let serialized = serde_json::to_string(metadata)?;
    if serialized.len() > MAX_METADATA_BYTES {
        return Err(Error::Invalid(format!(
            "metadata exceeds {MAX_METADATA_BYTES} bytes serialized"
        )));
    }
    Ok(())
}

/// Zero and negative TTLs mean "never expires"; anything above a year is rejected.
fn normalize_ttl(ttl: Option<i64>) -> Result<Option<u32>> {
    match ttl {
        None => Ok(None),
        Some(t) if t <= 0 => Ok(None),
        Some(t) if t > MAX_TTL_HOURS => Err(Error::Invalid(format!(
            "ttl_hours exceeds {MAX_TTL_HOURS}"
        ))),
        Some(t) => Ok(Some(t as u32)),
    }
}

/// Tags are a lowercased, deduplicated set; blanks are dropped.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && seen.insert(tag.clone()) {
            out.push(tag);
        }
    }
    out
}
