//! Result shaping for similarity queries.
//!
//! The store returns raw nearest-neighbor chunks; callers want one entry
//! per file with the matching text highlighted. [`rank`] does that:
//!
//! 1. Deduplicate by source path, keeping the lowest-distance chunk.
//! 2. Highlight the query (or its longest matching word run) in the content.
//! 3. Sort ascending by distance and truncate to `max_results`.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::ScoredDocument;

const MARK_OPEN: &str = "<mark>";
const MARK_CLOSE: &str = "</mark>";

/// A single ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Normalized path of the matching file.
    pub source: String,
    pub file_name: String,
    /// Text of the best-matching chunk.
    pub content: String,
    /// `content` with the matched phrase wrapped in `<mark>` tags.
    pub highlighted_content: String,
    /// Distance to the query; lower is better.
    pub score: f32,
}

/// Keep only the best (lowest-distance) hit for each source file.
///
/// Output order follows the first appearance of each source.
pub fn dedup_by_source(hits: Vec<ScoredDocument>) -> Vec<ScoredDocument> {
    let mut best: Vec<ScoredDocument> = Vec::new();
    let mut slot: HashMap<String, usize> = HashMap::new();

    for hit in hits {
        match slot.get(hit.document.source()) {
            Some(&i) => {
                if hit.score < best[i].score {
                    best[i] = hit;
                }
            }
            None => {
                slot.insert(hit.document.source().to_string(), best.len());
                best.push(hit);
            }
        }
    }
    best
}

/// Wrap the best match for `query` inside `content` with `<mark>` tags.
///
/// The full query is tried verbatim first. Otherwise contiguous runs of
/// query words are tried from longest to shortest, left to right, and the
/// first run found (longer than one character) is marked everywhere it
/// occurs. Content without any match is returned unchanged.
pub fn highlight(content: &str, query: &str) -> String {
    let query = query.trim();
    if query.is_empty() {
        return content.to_string();
    }
    if content.contains(query) {
        return mark_all(content, query);
    }

    let words: Vec<&str> = query.split_whitespace().collect();
    for len in (1..=words.len()).rev() {
        for start in 0..=(words.len() - len) {
            let phrase = words[start..start + len].join(" ");
            if phrase.chars().count() > 1 && content.contains(&phrase) {
                return mark_all(content, &phrase);
            }
        }
    }

    content.to_string()
}

fn mark_all(content: &str, phrase: &str) -> String {
    content.replace(phrase, &format!("{MARK_OPEN}{phrase}{MARK_CLOSE}"))
}

/// Deduplicate, highlight, sort and truncate raw hits.
pub fn rank(hits: Vec<ScoredDocument>, query: &str, max_results: usize) -> Vec<SearchHit> {
    let mut results: Vec<SearchHit> = dedup_by_source(hits)
        .into_iter()
        .map(|hit| {
            let doc = hit.document;
            SearchHit {
                highlighted_content: highlight(&doc.content, query),
                source: doc.metadata.source,
                file_name: doc.metadata.file_name,
                content: doc.content,
                score: hit.score,
            }
        })
        .collect();

    results.sort_by(|a, b| a.score.total_cmp(&b.score));
    results.truncate(max_results);
    results
}
