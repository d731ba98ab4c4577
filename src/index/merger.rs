//! Segment merger: consolidates several segments into one.
//!
//! Inputs arrive in recency order (oldest first). The merger streams a
//! k-way merge of their posting cursors and keeps, for every document, only
//! the postings of the newest input that knows the document at all; a
//! tombstone in a newer input drops the older postings the same way. The
//! output segment carries the surviving doc sketch and the surviving
//! tombstones, so segments outside the merge keep resolving against it
//! exactly as they did against the inputs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;

use crate::error::{Result, SwiftletError};
use crate::index::postings::{DocId, SegmentId};
use crate::index::segment::SegmentInfo;
use crate::index::segment_reader::{SegmentCursor, SegmentReader};
use crate::index::segment_writer::SegmentWriter;
use crate::storage::Storage;

/// Per-document resolution: which input owns the doc and whether that input
/// tombstones it.
#[derive(Clone, Copy)]
struct DocState {
    input: usize,
    deleted: bool,
}

/// Merge `inputs` (oldest first) into a new segment with id `output_id`.
///
/// On error the partial output files are removed and nothing else changes.
pub fn merge_segments(
    storage: &Arc<dyn Storage>,
    inputs: &[Arc<SegmentReader>],
    output_id: SegmentId,
    block_size: usize,
) -> Result<SegmentInfo> {
    debug!(
        "merging {} segments {:?} into segment {}",
        inputs.len(),
        inputs.iter().map(|r| r.info().id).collect::<Vec<_>>(),
        output_id
    );

    match run_merge(storage, inputs, output_id, block_size) {
        Ok(info) => Ok(info),
        Err(e) => {
            SegmentWriter::discard(storage.as_ref(), output_id);
            Err(e)
        }
    }
}

fn run_merge(
    storage: &Arc<dyn Storage>,
    inputs: &[Arc<SegmentReader>],
    output_id: SegmentId,
    block_size: usize,
) -> Result<SegmentInfo> {
    // Resolve every document to its newest input.
    let mut states: AHashMap<DocId, DocState> = AHashMap::new();
    for (input, reader) in inputs.iter().enumerate().rev() {
        for &doc_id in reader.docs() {
            states
                .entry(doc_id)
                .or_insert(DocState { input, deleted: false });
        }
        for &doc_id in reader.tombstones() {
            states
                .entry(doc_id)
                .or_insert(DocState { input, deleted: true });
        }
    }

    let mut writer = SegmentWriter::new(Arc::clone(storage), output_id, block_size)?;

    // K-way merge over all input cursors.
    let mut cursors: Vec<SegmentCursor> = inputs
        .iter()
        .map(|r| SegmentCursor::over(Arc::clone(r)))
        .collect();
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (input, cursor) in cursors.iter_mut().enumerate() {
        if let Some(posting) = cursor.next()? {
            heap.push(Reverse((posting, input)));
        }
    }

    while let Some(Reverse((posting, input))) = heap.pop() {
        if let Some(next) = cursors[input].next()? {
            heap.push(Reverse((next, input)));
        }

        // Every posting's doc must appear in its segment's sketch.
        let state = states.get(&posting.doc_id).copied().ok_or_else(|| {
            SwiftletError::corrupt_segment(inputs[input].info().id, 0)
        })?;
        if state.input == input && !state.deleted {
            writer.push(posting)?;
        }
    }

    let mut docs = Vec::new();
    let mut tombstones = Vec::new();
    for (&doc_id, state) in &states {
        if state.deleted {
            tombstones.push(doc_id);
        } else {
            docs.push(doc_id);
        }
    }
    docs.sort_unstable();
    tombstones.sort_unstable();

    writer.finish(&docs, &tombstones)
}
