//! Memory repository: row model, filter compiler, write path, read path.
//!
//! All memory SQL lives in [`store`] (writes) and [`recall`] (reads); the
//! filter-to-SQL translation is in [`query`]. Type definitions live in
//! [`types`]. This module holds the small text/time helpers shared across
//! the repository and engine layers.

pub mod query;
pub mod recall;
pub mod store;
pub mod types;

use chrono::{DateTime, Utc};

/// Serialize a timestamp for storage. All timestamps are RFC 3339 UTC text
/// with sub-second precision, so lexical ordering in SQL matches
/// chronological ordering.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a stored timestamp inside a rusqlite row closure.
pub(crate) fn parse_ts(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// First `max_chars` characters of `content`, cut on a char boundary.
pub(crate) fn excerpt(content: &str, max_chars: usize) -> &str {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

/// Split text into lowercase alphanumeric tokens of three or more characters,
/// with stop words removed. Used for session keyword histograms.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|word| {
            let cleaned: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
                .collect::<String>()
                .to_lowercase();
            if cleaned.len() >= 3 && !is_stop_word(&cleaned) {
                Some(cleaned)
            } else {
                None
            }
        })
        .collect()
}

fn is_stop_word(word: &str) -> bool {
    matches!(
        word,
        "the" | "and" | "for" | "are" | "but" | "not" | "you" | "all" | "can" | "had"
            | "her" | "was" | "one" | "our" | "out" | "has" | "have" | "been" | "were"
            | "this" | "that" | "these" | "those" | "with" | "from" | "they" | "will"
            | "would" | "could" | "should" | "about" | "into" | "over" | "after"
            | "before" | "between" | "during" | "through" | "when" | "where" | "which"
            | "while" | "what" | "their" | "there" | "then" | "them" | "than" | "some"
            | "such" | "very" | "just" | "also" | "more" | "most" | "other" | "only"
            | "does" | "did" | "done" | "being" | "because"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let stored = ts(now);
        let parsed = parse_ts(0, stored).unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn stored_timestamps_order_lexically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(250);
        assert!(ts(early) < ts(late));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("short", 120), "short");
        assert_eq!(excerpt("abcdef", 3), "abc");
        // multi-byte chars must not be split
        assert_eq!(excerpt("héllo wörld", 4), "héll");
    }

    #[test]
    fn tokenize_filters_and_lowercases() {
        let tokens = tokenize("The quick BROWN fox, the lazy dog!");
        assert!(tokens.contains(&"quick".to_string()));
        assert!(tokens.contains(&"brown".to_string()));
        assert!(tokens.contains(&"fox".to_string()));
        assert!(!tokens.contains(&"the".to_string()));
    }

    #[test]
    fn tokenize_drops_short_tokens() {
        let tokens = tokenize("a an to of api");
        assert_eq!(tokens, vec!["api".to_string()]);
    }
}
