//! Relevance ranking for memory recall.
//!
//! Scoring is deliberately simple: the number of distinct query terms that
//! appear among the entry's terms (key and UTF-8 value combined), with a
//! bonus when the whole query occurs verbatim in the key. An empty query
//! matches everything with equal relevance, which degrades to pure
//! recency order.

use std::collections::HashSet;

use crate::kv::KvEntry;

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn score(entry: &KvEntry, query_terms: &HashSet<String>, query_lower: &str) -> usize {
    let value_text = String::from_utf8_lossy(&entry.value);
    let entry_terms: HashSet<String> = terms(&entry.key).chain(terms(&value_text)).collect();

    let mut score = query_terms
        .iter()
        .filter(|t| entry_terms.contains(*t))
        .count();
    if !query_lower.is_empty() && entry.key.to_lowercase().contains(query_lower) {
        score = score.saturating_add(1);
    }
    score
}

/// Rank `entries` against `query`, returning at most `limit` of them.
///
/// Entries that share no term with a non-empty query are dropped.
#[must_use]
pub fn rank(entries: Vec<KvEntry>, query: &str, limit: usize) -> Vec<KvEntry> {
    let query_lower = query.trim().to_lowercase();
    let query_terms: HashSet<String> = terms(&query_lower).collect();

    let mut scored: Vec<(usize, KvEntry)> = entries
        .into_iter()
        .map(|e| (score(&e, &query_terms, &query_lower), e))
        .filter(|(s, _)| query_terms.is_empty() || *s > 0)
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| b.seq.cmp(&a.seq)));
    scored.into_iter().take(limit).map(|(_, e)| e).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str, seq: u64) -> KvEntry {
        KvEntry {
            namespace: "plugin:test".into(),
            key: key.into(),
            value: value.as_bytes().to_vec(),
            seq,
        }
    }

    #[test]
    fn more_matching_terms_rank_higher() {
        let ranked = rank(
            vec![
                entry("note-1", "\"rain in bergen\"", 1),
                entry("note-2", "\"rain and wind in bergen today\"", 2),
                entry("note-3", "\"sunny\"", 3),
            ],
            "bergen wind",
            10,
        );
        let keys: Vec<_> = ranked.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["note-2", "note-1"]);
    }

    #[test]
    fn ties_prefer_most_recent_write() {
        let ranked = rank(
            vec![
                entry("a", "\"coffee\"", 5),
                entry("b", "\"coffee\"", 9),
                entry("c", "\"coffee\"", 7),
            ],
            "coffee",
            10,
        );
        let keys: Vec<_> = ranked.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
    }

    #[test]
    fn limit_is_respected() {
        let entries = (0..10).map(|i| entry(&format!("k{i}"), "\"x\"", i)).collect();
        assert_eq!(rank(entries, "x", 3).len(), 3);
    }

    #[test]
    fn empty_query_is_recency_order() {
        let ranked = rank(vec![entry("old", "1", 1), entry("new", "2", 2)], "  ", 5);
        assert_eq!(ranked[0].key, "new");
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn key_substring_bonus() {
        let ranked = rank(
            vec![entry("user-prefs", "\"dark\"", 1), entry("other", "\"user prefs\"", 2)],
            "user-prefs",
            5,
        );
        assert_eq!(ranked[0].key, "user-prefs");
    }
}
