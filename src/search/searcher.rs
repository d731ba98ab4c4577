//! Multi-segment search execution.
//!
//! A search snapshots the manifest and the in-memory buffer, then scores
//! each query term against the segments from newest to oldest. A document's
//! postings only count from the newest segment that knows the document at
//! all; older segments are masked, which is what makes upserts and deletes
//! take effect without rewriting history.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;

use crate::config::SearchOptions;
use crate::error::{Result, SwiftletError};
use crate::index::index::Index;
use crate::index::manifest::Manifest;
use crate::index::memory_segment::MemorySegment;
use crate::index::postings::{DocId, Term};
use crate::index::segment_reader::SegmentReader;
use crate::search::results::{filter_results, sort_results, SearchResult};

/// A uniform view over the searchable segment kinds, newest first.
pub(crate) enum SegmentView {
    /// The live or frozen in-memory buffer.
    Memory(Arc<MemorySegment>),
    /// An open on-disk segment.
    Disk(Arc<SegmentReader>),
}

impl SegmentView {
    fn may_contain_term(&self, term: Term) -> bool {
        match self {
            SegmentView::Memory(_) => true,
            SegmentView::Disk(reader) => reader.contains_term_range(term, term),
        }
    }

    fn find(&self, term: Term) -> Result<Vec<DocId>> {
        match self {
            SegmentView::Memory(segment) => Ok(segment.find(term).to_vec()),
            SegmentView::Disk(reader) => reader.find(term),
        }
    }

    pub(crate) fn contains_doc(&self, doc_id: DocId) -> bool {
        match self {
            SegmentView::Memory(segment) => segment.contains_doc(doc_id),
            SegmentView::Disk(reader) => reader.contains_doc(doc_id),
        }
    }

    pub(crate) fn is_tombstoned(&self, doc_id: DocId) -> bool {
        match self {
            SegmentView::Memory(segment) => segment.is_tombstoned(doc_id),
            SegmentView::Disk(reader) => reader.is_tombstoned(doc_id),
        }
    }

    fn segment_id(&self) -> Option<u32> {
        match self {
            SegmentView::Memory(_) => None,
            SegmentView::Disk(reader) => Some(reader.info().id),
        }
    }
}

/// Snapshot the index into segment views ordered newest to oldest: live
/// buffer, frozen buffer, then on-disk segments in reverse manifest order.
///
/// A concurrent merge may retire segment files between the manifest read and
/// the segment open; in that case the open is retried against the fresher
/// manifest instead of failing the search.
pub(crate) fn snapshot_views(index: &Index) -> Result<Vec<SegmentView>> {
    const MAX_RETRIES: usize = 3;

    'retry: for _ in 0..MAX_RETRIES {
        // Read order matters against a concurrent flush: the buffer and the
        // frozen pointer first, the manifest last. Whatever leaves the
        // buffer before the manifest read is then guaranteed to show up in
        // the manifest; seeing the same document twice is harmless, the
        // owner resolution counts it once.
        let memory = index.memory.read().clone();
        let frozen = index.frozen.read().clone();
        let manifest = Manifest::clone_handle(&index.manifest);

        let mut views = Vec::with_capacity(manifest.segments.len() + 2);
        views.push(SegmentView::Memory(memory));
        if let Some(frozen) = frozen {
            views.push(SegmentView::Memory(frozen));
        }

        for info in manifest.segments.iter().rev() {
            match index.open_reader(info) {
                Ok(reader) => views.push(SegmentView::Disk(reader)),
                Err(SwiftletError::NotFound { .. })
                    if !Manifest::clone_handle(&index.manifest)
                        .segments
                        .iter()
                        .any(|s| s.id == info.id) =>
                {
                    // The segment was merged away under us; take a fresh
                    // snapshot.
                    continue 'retry;
                }
                Err(e) => return Err(e),
            }
        }

        return Ok(views);
    }

    Err(SwiftletError::storage(
        "segment set kept changing during snapshot",
    ))
}

/// Resolve which view owns a document: the newest one that lists it, either
/// live or tombstoned. `None` means the document is dead.
fn resolve_owner(views: &[SegmentView], doc_id: DocId) -> Option<usize> {
    for (ord, view) in views.iter().enumerate() {
        if view.is_tombstoned(doc_id) {
            return None;
        }
        if view.contains_doc(doc_id) {
            return Some(ord);
        }
    }
    None
}

/// Execute a query against a snapshot of the index.
pub(crate) fn execute(
    index: &Index,
    terms: &[Term],
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    if terms.is_empty() || options.limit == 0 {
        return Ok(Vec::new());
    }

    // Duplicate query terms each count once per occurrence.
    let mut term_counts: AHashMap<Term, u32> = AHashMap::with_capacity(terms.len());
    for &term in terms {
        *term_counts.entry(term).or_insert(0) += 1;
    }

    let views = snapshot_views(index)?;
    let mut scores: AHashMap<DocId, u32> = AHashMap::new();
    let mut owners: AHashMap<DocId, Option<usize>> = AHashMap::new();

    for (&term, &count) in &term_counts {
        for ord in 0..views.len() {
            if let Some(deadline) = options.deadline {
                if Instant::now() >= deadline {
                    return Err(SwiftletError::Timeout);
                }
            }

            let view = &views[ord];
            if !view.may_contain_term(term) {
                continue;
            }

            let doc_ids = match view.find(term) {
                Ok(doc_ids) => doc_ids,
                Err(e) => {
                    // Drop the cached handle so a later search can reopen it.
                    if let Some(segment_id) = view.segment_id() {
                        index.cache.evict(&index.name, segment_id);
                    }
                    return Err(e);
                }
            };

            for doc_id in doc_ids {
                let owner = *owners
                    .entry(doc_id)
                    .or_insert_with(|| resolve_owner(&views, doc_id));
                // Only the owning view's postings count; anything older is a
                // stale version of the document.
                if owner == Some(ord) {
                    *scores.entry(doc_id).or_insert(0) += count;
                }
            }
        }
    }

    let mut results: Vec<SearchResult> = scores
        .into_iter()
        .map(|(doc_id, score)| SearchResult::new(doc_id, score))
        .collect();
    sort_results(&mut results);
    filter_results(&mut results, options.limit, options.min_score);
    Ok(results)
}
