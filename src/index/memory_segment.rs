//! Mutable in-memory postings buffer.
//!
//! Every mutation lands here first. The buffer is a sorted mapping from term
//! to doc ids plus a tombstone set; for search purposes it behaves like the
//! newest segment of the index. Once its approximate footprint crosses the
//! flush threshold the writer freezes it and turns it into an on-disk
//! segment.

use std::collections::{BTreeMap, BTreeSet};

use crate::index::postings::{DocId, Posting, Term};

// Rough per-entry bookkeeping costs for the footprint estimate.
const DOC_ENTRY_COST: usize = 48;
const POSTING_COST: usize = 12;

/// Mutable sorted postings buffer with per-document last-write-wins.
#[derive(Debug, Clone, Default)]
pub struct MemorySegment {
    /// term -> sorted doc ids.
    postings: BTreeMap<Term, Vec<DocId>>,
    /// doc id -> sorted distinct terms of its current version.
    docs: BTreeMap<DocId, Vec<Term>>,
    /// Docs deleted since this buffer was created.
    tombstones: BTreeSet<DocId>,
    /// Approximate heap footprint, maintained incrementally.
    approx_bytes: usize,
}

impl MemorySegment {
    /// Create an empty buffer.
    pub fn new() -> Self {
        MemorySegment::default()
    }

    /// Insert or replace a document.
    ///
    /// Any postings a previous upsert of the same doc left in this buffer are
    /// removed first; duplicate terms collapse to one posting. A tombstone
    /// for the doc is cleared.
    pub fn upsert(&mut self, doc_id: DocId, terms: &[Term]) {
        self.remove_postings(doc_id);
        self.tombstones.remove(&doc_id);

        let mut terms: Vec<Term> = terms.to_vec();
        terms.sort_unstable();
        terms.dedup();

        for &term in &terms {
            let doc_ids = self.postings.entry(term).or_default();
            if let Err(pos) = doc_ids.binary_search(&doc_id) {
                doc_ids.insert(pos, doc_id);
            }
        }

        self.approx_bytes += DOC_ENTRY_COST + terms.len() * POSTING_COST;
        self.docs.insert(doc_id, terms);
    }

    /// Delete a document, removing its buffered postings and recording a
    /// tombstone so older segments stop answering for it.
    pub fn delete(&mut self, doc_id: DocId) {
        self.remove_postings(doc_id);
        if self.tombstones.insert(doc_id) {
            self.approx_bytes += DOC_ENTRY_COST;
        }
    }

    fn remove_postings(&mut self, doc_id: DocId) {
        let Some(terms) = self.docs.remove(&doc_id) else {
            return;
        };

        for term in &terms {
            if let Some(doc_ids) = self.postings.get_mut(term) {
                if let Ok(pos) = doc_ids.binary_search(&doc_id) {
                    doc_ids.remove(pos);
                }
                if doc_ids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }

        self.approx_bytes = self
            .approx_bytes
            .saturating_sub(DOC_ENTRY_COST + terms.len() * POSTING_COST);
    }

    /// Doc ids with postings for `term`, in ascending order.
    pub fn find(&self, term: Term) -> &[DocId] {
        self.postings.get(&term).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the doc is live in this buffer.
    pub fn contains_doc(&self, doc_id: DocId) -> bool {
        self.docs.contains_key(&doc_id)
    }

    /// Whether the doc has been deleted through this buffer.
    pub fn is_tombstoned(&self, doc_id: DocId) -> bool {
        self.tombstones.contains(&doc_id)
    }

    /// Number of live documents.
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    /// Whether the buffer records nothing at all (no docs, no tombstones).
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty() && self.tombstones.is_empty()
    }

    /// Approximate heap footprint in bytes.
    pub fn approximate_bytes(&self) -> usize {
        self.approx_bytes
    }

    /// Iterate all postings in `(term asc, doc_id asc)` order.
    pub fn postings(&self) -> impl Iterator<Item = Posting> + '_ {
        self.postings.iter().flat_map(|(&term, doc_ids)| {
            doc_ids.iter().map(move |&doc_id| Posting::new(term, doc_id))
        })
    }

    /// Sorted ids of live documents.
    pub fn doc_ids(&self) -> Vec<DocId> {
        self.docs.keys().copied().collect()
    }

    /// Live documents with their current terms, ascending by doc id.
    pub fn docs_with_terms(&self) -> impl Iterator<Item = (DocId, &[Term])> + '_ {
        self.docs.iter().map(|(&doc_id, terms)| (doc_id, terms.as_slice()))
    }

    /// Sorted ids of tombstoned documents.
    pub fn tombstone_ids(&self) -> Vec<DocId> {
        self.tombstones.iter().copied().collect()
    }
}
