//! Query filter compiler.
//!
//! Translates a [`QueryFilter`] into a page query and a count query plus
//! their bound parameter lists. No filter field is ever interpolated into the
//! SQL text; the only dynamic shape is the optional FTS join and the number
//! of metadata predicates, both expanded structurally.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use super::ts;
use crate::memory::types::QueryFilter;

/// Column list shared by every memory SELECT.
pub(crate) const MEMORY_COLUMNS: &str = "memories.id, memories.user_id, memories.session_id, \
     memories.content, memories.importance, memories.created_at, memories.updated_at, \
     memories.expires_at, memories.ttl_hours, memories.metadata, memories.tags, \
     memories.access_count, memories.last_accessed_at";

/// A compiled filter: page query, count query, and their bound parameters.
pub struct CompiledQuery {
    pub select_sql: String,
    pub count_sql: String,
    pub select_params: Vec<Value>,
    pub count_params: Vec<Value>,
    pub has_keywords: bool,
}

/// Compile `filter` against the effective `limit`/`offset`.
///
/// The page query asks for `limit + 1` rows; the probe row answers `has_next`
/// without a second COUNT. Expired rows are always excluded.
pub fn compile(filter: &QueryFilter, now: DateTime<Utc>, limit: u32, offset: u32) -> CompiledQuery {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    conditions.push("(memories.expires_at IS NULL OR memories.expires_at > ?)".into());
    params.push(Value::Text(ts(now)));

    if let Some(ref user_id) = filter.user_id {
        conditions.push("memories.user_id = ?".into());
        params.push(Value::Text(user_id.clone()));
    }
    if let Some(ref session_id) = filter.session_id {
        conditions.push("memories.session_id = ?".into());
        params.push(Value::Text(session_id.clone()));
    }
    if let Some(from) = filter.date_from {
        conditions.push("memories.created_at >= ?".into());
        params.push(Value::Text(ts(from)));
    }
    if let Some(to) = filter.date_to {
        conditions.push("memories.created_at < ?".into());
        params.push(Value::Text(ts(to)));
    }
    if let Some(min) = filter.min_importance {
        conditions.push("memories.importance >= ?".into());
        params.push(Value::Real(min));
    }

    for (key, value) in &filter.metadata {
        push_metadata_predicate(&mut conditions, &mut params, key, value);
    }

    let has_keywords = !filter.keywords.is_empty();
    let from_clause = if has_keywords {
        conditions.push("memories_fts MATCH ?".into());
        params.push(Value::Text(filter.keywords.join(" ")));
        "FROM memories JOIN memories_fts ON memories.rowid = memories_fts.rowid"
    } else {
        "FROM memories"
    };

    let where_clause = format!("WHERE {}", conditions.join(" AND "));

    // Ties always break on id so identical filters return identical orderings
    let order_clause = if has_keywords {
        "ORDER BY bm25(memories_fts), memories.importance DESC, \
         memories.created_at DESC, memories.id"
    } else {
        "ORDER BY memories.created_at DESC, memories.importance DESC, memories.id"
    };

    let select_sql = format!(
        "SELECT {MEMORY_COLUMNS} {from_clause} {where_clause} {order_clause} LIMIT ? OFFSET ?"
    );
    let count_sql = format!("SELECT COUNT(*) {from_clause} {where_clause}");

    let count_params = params.clone();
    let mut select_params = params;
    select_params.push(Value::Integer(limit as i64 + 1));
    select_params.push(Value::Integer(offset as i64));

    CompiledQuery {
        select_sql,
        count_sql,
        select_params,
        count_params,
        has_keywords,
    }
}

/// Equality predicate on one top-level metadata key.
///
/// The JSON path binds as a parameter (`$."key"`), so an unknown or odd key
/// can only ever match nothing, never change the SQL shape.
fn push_metadata_predicate(
    conditions: &mut Vec<String>,
    params: &mut Vec<Value>,
    key: &str,
    value: &serde_json::Value,
) {
    // A quote inside a key cannot be expressed in a bound JSON path; such a
    // key matches no stored metadata, so the predicate is a constant miss.
    if key.contains('"') {
        conditions.push("0 = 1".into());
        return;
    }
    let path = format!("$.\"{key}\"");

    match value {
        serde_json::Value::String(s) => {
            conditions.push("json_extract(memories.metadata, ?) = ?".into());
            params.push(Value::Text(path));
            params.push(Value::Text(s.clone()));
        }
        serde_json::Value::Number(n) => {
            conditions.push("json_extract(memories.metadata, ?) = ?".into());
            params.push(Value::Text(path));
            if let Some(i) = n.as_i64() {
                params.push(Value::Integer(i));
            } else {
                params.push(Value::Real(n.as_f64().unwrap_or(f64::NAN)));
            }
        }
        serde_json::Value::Bool(b) => {
            conditions.push("json_extract(memories.metadata, ?) = ?".into());
            params.push(Value::Text(path));
            params.push(Value::Integer(*b as i64));
        }
        serde_json::Value::Null => {
            // Matches an explicit JSON null, not a missing key
            conditions.push("json_type(memories.metadata, ?) = 'null'".into());
            params.push(Value::Text(path));
        }
        composite @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
            conditions.push("json_extract(memories.metadata, ?) = json(?)".into());
            params.push(Value::Text(path));
            params.push(Value::Text(composite.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn compile_default(filter: &QueryFilter) -> CompiledQuery {
        compile(filter, Utc::now(), 50, 0)
    }

    #[test]
    fn bare_filter_only_excludes_expired() {
        let compiled = compile_default(&QueryFilter::default());
        assert!(compiled.select_sql.contains("expires_at IS NULL"));
        assert!(!compiled.select_sql.contains("MATCH"));
        assert!(compiled
            .select_sql
            .contains("ORDER BY memories.created_at DESC, memories.importance DESC, memories.id"));
        // now + limit + offset
        assert_eq!(compiled.select_params.len(), 3);
        assert_eq!(compiled.count_params.len(), 1);
    }

    #[test]
    fn keywords_add_fts_join_and_rank_ordering() {
        let filter = QueryFilter {
            user_id: Some("alice".into()),
            keywords: vec!["API".into(), "design".into()],
            ..Default::default()
        };
        let compiled = compile_default(&filter);

        assert!(compiled.has_keywords);
        assert!(compiled
            .select_sql
            .contains("JOIN memories_fts ON memories.rowid = memories_fts.rowid"));
        assert!(compiled.select_sql.contains("memories_fts MATCH ?"));
        assert!(compiled.select_sql.contains("ORDER BY bm25(memories_fts)"));
        // keyword terms join with implicit AND
        assert!(compiled
            .select_params
            .iter()
            .any(|p| matches!(p, Value::Text(t) if t == "API design")));
    }

    #[test]
    fn all_scalar_predicates_bind() {
        let now = Utc::now();
        let filter = QueryFilter {
            user_id: Some("alice".into()),
            session_id: Some("s1".into()),
            date_from: Some(now - chrono::Duration::days(7)),
            date_to: Some(now),
            min_importance: Some(0.4),
            ..Default::default()
        };
        let compiled = compile(&filter, now, 10, 20);

        assert!(compiled.select_sql.contains("memories.user_id = ?"));
        assert!(compiled.select_sql.contains("memories.session_id = ?"));
        assert!(compiled.select_sql.contains("memories.created_at >= ?"));
        assert!(compiled.select_sql.contains("memories.created_at < ?"));
        assert!(compiled.select_sql.contains("memories.importance >= ?"));
        // 6 predicates + limit + offset
        assert_eq!(compiled.select_params.len(), 8);
        assert_eq!(compiled.count_params.len(), 6);
        // probe row: limit + 1
        assert!(compiled
            .select_params
            .iter()
            .any(|p| matches!(p, Value::Integer(11))));
    }

    #[test]
    fn metadata_predicates_bind_path_and_value() {
        let mut metadata = HashMap::new();
        metadata.insert("topic".to_string(), serde_json::json!("design"));
        metadata.insert("priority".to_string(), serde_json::json!(3));
        let filter = QueryFilter {
            metadata,
            ..Default::default()
        };
        let compiled = compile_default(&filter);

        assert_eq!(
            compiled
                .select_sql
                .matches("json_extract(memories.metadata, ?)")
                .count(),
            2
        );
        assert!(compiled
            .select_params
            .iter()
            .any(|p| matches!(p, Value::Text(t) if t == "$.\"topic\"")));
        assert!(compiled
            .select_params
            .iter()
            .any(|p| matches!(p, Value::Integer(3))));
        // no interpolated key anywhere in the SQL text
        assert!(!compiled.select_sql.contains("topic"));
    }

    #[test]
    fn quoted_metadata_key_matches_nothing() {
        let mut metadata = HashMap::new();
        metadata.insert("we\"ird".to_string(), serde_json::json!(1));
        let filter = QueryFilter {
            metadata,
            ..Default::default()
        };
        let compiled = compile_default(&filter);
        assert!(compiled.select_sql.contains("0 = 1"));
    }

    #[test]
    fn count_query_has_no_order_or_limit() {
        let filter = QueryFilter {
            keywords: vec!["notes".into()],
            ..Default::default()
        };
        let compiled = compile_default(&filter);
        assert!(compiled.count_sql.starts_with("SELECT COUNT(*)"));
        assert!(!compiled.count_sql.contains("ORDER BY"));
        assert!(!compiled.count_sql.contains("LIMIT"));
        assert!(compiled.count_sql.contains("memories_fts MATCH ?"));
    }
}
