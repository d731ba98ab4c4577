//! Segment metadata and on-disk naming.
//!
//! A segment is immutable once written. It consists of a data file
//! (`segment_<id>.fid`) holding the posting blocks followed by the document
//! sketches, and a skip-index file (`segment_<id>.fii`) with one
//! `(first_term, offset)` entry per block.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwiftletError};
use crate::index::postings::{DocId, SegmentId, Term};
use crate::util::varint::{decode_u32, encode_u32};

/// Metadata for one immutable on-disk segment, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Monotonically assigned segment id; never reused.
    pub id: SegmentId,

    /// Number of posting blocks in the data file.
    pub block_count: u64,

    /// Largest term present in the segment; 0 when the segment holds no
    /// postings.
    pub last_key: Term,

    /// Checksum of the skip-index entries, re-verified when the segment is
    /// opened.
    pub checksum: u32,

    /// Number of live documents in the segment.
    pub doc_count: u32,
}

impl SegmentInfo {
    /// Base name of the segment's files.
    pub fn name(&self) -> String {
        format!("segment_{}", self.id)
    }

    /// Name of the data file holding the posting blocks.
    pub fn data_file_name(&self) -> String {
        format!("{}.fid", self.name())
    }

    /// Name of the skip-index file.
    pub fn index_file_name(&self) -> String {
        format!("{}.fii", self.name())
    }

    /// Whether any postings in `[lo, hi]` can exist in this segment.
    ///
    /// `first_key` is the first skip entry's term; the caller has it from the
    /// opened reader. With no blocks the segment holds no postings at all.
    pub fn overlaps_range(&self, first_key: Term, lo: Term, hi: Term) -> bool {
        self.block_count > 0 && first_key <= hi && lo <= self.last_key
    }
}

/// Encode a sorted doc id list (sketch) with a count prefix, delta
/// compression and a trailing checksum.
pub(crate) fn encode_doc_list(buf: &mut Vec<u8>, docs: &[DocId]) {
    let start = buf.len();
    encode_u32(buf, docs.len() as u32);

    let mut previous = 0u32;
    for (i, &doc_id) in docs.iter().enumerate() {
        let delta = if i == 0 { doc_id } else { doc_id - previous };
        encode_u32(buf, delta);
        previous = doc_id;
    }

    let crc = crc32fast::hash(&buf[start..]);
    let mut trailer = [0u8; 4];
    LittleEndian::write_u32(&mut trailer, crc);
    buf.extend_from_slice(&trailer);
}

/// Decode a doc id list written by [`encode_doc_list`], advancing `pos`.
pub(crate) fn decode_doc_list(data: &[u8], pos: &mut usize) -> Result<Vec<DocId>> {
    let start = *pos;

    let (count, len) = decode_u32(&data[start..])?;
    let mut cursor = start + len;

    let mut docs = Vec::with_capacity(count as usize);
    let mut previous = 0u32;
    for i in 0..count {
        let (delta, len) = decode_u32(&data[cursor..])?;
        cursor += len;
        let doc_id = if i == 0 {
            delta
        } else {
            previous
                .checked_add(delta)
                .ok_or_else(|| SwiftletError::storage("doc id delta overflow"))?
        };
        docs.push(doc_id);
        previous = doc_id;
    }

    if cursor + 4 > data.len() {
        return Err(SwiftletError::storage("doc list truncated before checksum"));
    }
    let stored_crc = LittleEndian::read_u32(&data[cursor..cursor + 4]);
    let actual_crc = crc32fast::hash(&data[start..cursor]);
    if stored_crc != actual_crc {
        return Err(SwiftletError::storage("doc list checksum mismatch"));
    }
    *pos = cursor + 4;

    Ok(docs)
}
