//! Session summarization.
//!
//! Builds a [`SessionDigest`] from a session's live memories: counters, time
//! range, the most important excerpts, and a keyword histogram over the
//! indexed tokens.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::types::QueryFilter;
use crate::memory::{excerpt, recall, tokenize};

/// How many top-importance excerpts a digest carries.
const TOP_MEMORY_COUNT: usize = 10;
/// Characters of content kept per excerpt.
const EXCERPT_CHARS: usize = 120;
/// Keywords kept in the histogram.
const HISTOGRAM_SIZE: usize = 20;
/// Upper bound of memories read for one digest.
const DIGEST_SCAN_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDigest {
    pub session_id: String,
    pub user_id: String,
    pub memory_count: u64,
    pub total_importance: f64,
    pub avg_importance: f64,
    pub first_created_at: DateTime<Utc>,
    pub last_created_at: DateTime<Utc>,
    pub top_memories: Vec<MemoryExcerpt>,
    pub keyword_histogram: Vec<KeywordCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryExcerpt {
    pub id: String,
    pub excerpt: String,
    pub importance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordCount {
    pub keyword: String,
    pub count: u64,
}

/// Digest one session. Returns `None` when it holds no live memories.
pub fn summarize(
    conn: &Connection,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<SessionDigest>> {
    let filter = QueryFilter {
        session_id: Some(session_id.to_string()),
        ..Default::default()
    };
    let page = recall::list_by_filter(conn, &filter, now, DIGEST_SCAN_LIMIT, 0)?;
    if page.is_empty() {
        return Ok(None);
    }
    let memories = page.data;

    let user_id = memories[0].user_id.clone();
    let memory_count = memories.len() as u64;
    let total_importance: f64 = memories.iter().map(|m| m.importance).sum();
    let first_created_at = memories.iter().map(|m| m.created_at).min().unwrap_or(now);
    let last_created_at = memories.iter().map(|m| m.created_at).max().unwrap_or(now);

    // Top-K excerpts by importance, id tie-break for determinism
    let mut ranked: Vec<&crate::memory::types::Memory> = memories.iter().collect();
    ranked.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    let top_memories = ranked
        .iter()
        .take(TOP_MEMORY_COUNT)
        .map(|m| MemoryExcerpt {
            id: m.id.clone(),
            excerpt: excerpt(&m.content, EXCERPT_CHARS).to_string(),
            importance: m.importance,
        })
        .collect();

    let keyword_histogram = histogram(&memories);

    Ok(Some(SessionDigest {
        session_id: session_id.to_string(),
        user_id,
        memory_count,
        total_importance,
        avg_importance: total_importance / memory_count as f64,
        first_created_at,
        last_created_at,
        top_memories,
        keyword_histogram,
    }))
}

/// Token frequency over content and tags, most frequent first.
fn histogram(memories: &[crate::memory::types::Memory]) -> Vec<KeywordCount> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for memory in memories {
        for token in tokenize(&memory.content) {
            *counts.entry(token).or_insert(0) += 1;
        }
        for tag in &memory.tags {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
    }

    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
        .into_iter()
        .take(HISTOGRAM_SIZE)
        .map(|(keyword, count)| KeywordCount { keyword, count })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store;
    use crate::memory::types::MemoryDraft;
    use crate::session;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        crate::db::migrations::run_migrations(&conn).unwrap();
        conn
    }

    fn add(conn: &Connection, session_id: &str, content: &str, importance: f64) -> String {
        session::ensure(conn, session_id, "alice", Utc::now()).unwrap();
        let mut draft = MemoryDraft::new("alice", session_id, content);
        draft.importance = importance;
        let memory = draft.into_memory(Utc::now()).unwrap();
        store::insert(conn, &memory).unwrap();
        memory.id
    }

    #[test]
    fn empty_session_has_no_digest() {
        let conn = test_db();
        session::ensure(&conn, "s1", "alice", Utc::now()).unwrap();
        assert!(summarize(&conn, "s1", Utc::now()).unwrap().is_none());
        assert!(summarize(&conn, "never-created", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn digest_aggregates_importance_and_range() {
        let conn = test_db();
        add(&conn, "s1", "Sprint retrospective covered deployment pain", 0.9);
        add(&conn, "s1", "Deployment pipeline needs caching layer", 0.5);

        let digest = summarize(&conn, "s1", Utc::now()).unwrap().unwrap();
        assert_eq!(digest.user_id, "alice");
        assert_eq!(digest.memory_count, 2);
        assert!((digest.total_importance - 1.4).abs() < 1e-9);
        assert!((digest.avg_importance - 0.7).abs() < 1e-9);
        assert!(digest.first_created_at <= digest.last_created_at);
    }

    #[test]
    fn top_excerpts_rank_by_importance_and_truncate() {
        let conn = test_db();
        for i in 0..15 {
            add(
                &conn,
                "s1",
                &format!("note {i} {}", "filler ".repeat(40)),
                i as f64 / 20.0,
            );
        }

        let digest = summarize(&conn, "s1", Utc::now()).unwrap().unwrap();
        assert_eq!(digest.top_memories.len(), 10);
        // descending importance
        for pair in digest.top_memories.windows(2) {
            assert!(pair[0].importance >= pair[1].importance);
        }
        for item in &digest.top_memories {
            assert!(item.excerpt.chars().count() <= 120);
        }
    }

    #[test]
    fn histogram_counts_repeated_tokens() {
        let conn = test_db();
        add(&conn, "s1", "deployment broke again", 0.5);
        add(&conn, "s1", "deployment fixed after rollback", 0.5);

        let digest = summarize(&conn, "s1", Utc::now()).unwrap().unwrap();
        let top = &digest.keyword_histogram[0];
        assert_eq!(top.keyword, "deployment");
        assert_eq!(top.count, 2);
    }

    #[test]
    fn histogram_includes_tags() {
        let conn = test_db();
        session::ensure(&conn, "s1", "alice", Utc::now()).unwrap();
        let mut draft = MemoryDraft::new("alice", "s1", "plain words only");
        draft.tags = vec!["infra".into()];
        store::insert(&conn, &draft.into_memory(Utc::now()).unwrap()).unwrap();

        let digest = summarize(&conn, "s1", Utc::now()).unwrap().unwrap();
        assert!(digest
            .keyword_histogram
            .iter()
            .any(|k| k.keyword == "infra"));
    }
}
