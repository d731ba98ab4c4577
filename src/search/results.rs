//! Search results and their canonical ordering.

use crate::index::postings::DocId;

/// One search hit: a document and the number of query terms it matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// The matching document.
    pub doc_id: DocId,
    /// Number of query term occurrences present in the document.
    pub score: u32,
}

impl SearchResult {
    /// Create a new result.
    pub fn new(doc_id: DocId, score: u32) -> Self {
        SearchResult { doc_id, score }
    }
}

/// Sort results by `(score desc, doc_id asc)`, the deterministic order every
/// response uses.
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_unstable_by(|a, b| b.score.cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
}

/// Drop results below `min_score` (inclusive bound), then truncate to
/// `limit`. Expects sorted input.
pub fn filter_results(results: &mut Vec<SearchResult>, limit: usize, min_score: u32) {
    results.retain(|r| r.score >= min_score);
    results.truncate(limit);
}
