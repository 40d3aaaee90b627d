//! Local-first memory engine for AI agents.
//!
//! Memex stores short textual "memories" grouped into sessions and owned by
//! users, with importance scoring, TTL expiry, intelligent decay, and
//! full-text recall. Everything lives in one SQLite file; recall stays fast
//! against millions of records through FTS5 and compound indexes.
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL) behind a single-writer pool and a
//!   multi-reader pool
//! - **Search**: FTS5 over content and tags, BM25-ranked, with deterministic
//!   tie-breaking
//! - **Retention**: per-user quotas, TTL expiry, and a four-pass decay
//!   subsystem running on demand or on a background timer
//! - **Surface**: a blocking, JSON-friendly operation set consumed by REST
//!   and FFI façades alike
//!
//! # Modules
//!
//! - [`config`]: JSON configuration with defaults and validation
//! - [`error`]: the typed error taxonomy and FFI error codes
//! - [`db`]: connection pools, schema, and migrations
//! - [`memory`]: memory records, the filter compiler, write and read paths
//! - [`session`]: session records and their repository
//! - [`stats`]: aggregate statistics
//! - [`engine`]: the [`Memex`] engine and its decay, limits, and access guts
//! - [`registry`]: integer-handle registry for embedders
//!
//! # Example
//!
//! ```no_run
//! use memex::{Memex, MemexConfig, MemoryDraft, QueryFilter};
//!
//! let engine = Memex::new(MemexConfig::default())?;
//!
//! let mut draft = MemoryDraft::new("alice", "s1", "Meeting notes about API design");
//! draft.importance = 0.8;
//! let id = engine.save(draft)?;
//!
//! let page = engine.recall(QueryFilter {
//!     user_id: Some("alice".into()),
//!     keywords: vec!["API".into()],
//!     limit: Some(10),
//!     ..Default::default()
//! })?;
//! assert_eq!(page.data[0].id, id);
//! # Ok::<(), memex::Error>(())
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod memory;
pub mod registry;
pub mod session;
pub mod stats;

pub use config::MemexConfig;
pub use engine::summary::SessionDigest;
pub use engine::Memex;
pub use error::{error_message, Error, Result};
pub use memory::types::{
    BatchResponse, BatchResult, BatchStatus, DecayPlan, DecayPolicy, DecayStats, Memory,
    MemoryDraft, MemoryPatch, Page, QueryFilter,
};
pub use registry::Registry;
pub use session::Session;
pub use stats::{SessionAnalytics, StoreStats, UserStats};

/// Crate version string, as exposed through the operation surface.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
