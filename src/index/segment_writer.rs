//! Segment writer: streams sorted postings into an immutable segment.
//!
//! The data file receives the posting blocks followed by the live-document
//! sketch and the tombstone sketch; the skip-index file receives one
//! `(first_term, offset)` entry per block plus a checksummed footer. Both
//! files are fsynced before `finish` returns, so a manifest may reference
//! the segment as soon as the returned [`SegmentInfo`] is published.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::index::block::BlockEncoder;
use crate::index::postings::{DocId, Posting, SegmentId, Term};
use crate::index::segment::{encode_doc_list, SegmentInfo};
use crate::storage::{Storage, StorageOutput};

/// Writer for one on-disk segment.
pub struct SegmentWriter {
    storage: Arc<dyn Storage>,
    id: SegmentId,
    block_size: usize,
    data_out: Box<dyn StorageOutput>,
    encoder: BlockEncoder,
    skip_entries: Vec<(Term, u64)>,
    last_key: Term,
    #[cfg(debug_assertions)]
    last_posting: Option<Posting>,
}

impl SegmentWriter {
    /// Create a writer for segment `id`, truncating any leftover files.
    pub fn new(storage: Arc<dyn Storage>, id: SegmentId, block_size: usize) -> Result<Self> {
        let info = SegmentInfo {
            id,
            block_count: 0,
            last_key: 0,
            checksum: 0,
            doc_count: 0,
        };
        let data_out = storage.create_output(&info.data_file_name())?;

        Ok(SegmentWriter {
            storage,
            id,
            block_size,
            data_out,
            encoder: BlockEncoder::new(block_size),
            skip_entries: Vec::new(),
            last_key: 0,
            #[cfg(debug_assertions)]
            last_posting: None,
        })
    }

    /// Append a posting. Postings must arrive in `(term asc, doc_id asc)`
    /// order with no duplicates.
    pub fn push(&mut self, posting: Posting) -> Result<()> {
        #[cfg(debug_assertions)]
        {
            if let Some(last) = self.last_posting {
                debug_assert!(last < posting, "postings must be strictly increasing");
            }
            self.last_posting = Some(posting);
        }

        if !self.encoder.try_push(posting) {
            self.seal_block()?;
            let accepted = self.encoder.try_push(posting);
            debug_assert!(accepted, "a posting always fits an empty block");
        }
        self.last_key = posting.term;
        Ok(())
    }

    fn seal_block(&mut self) -> Result<()> {
        let offset = self.skip_entries.len() as u64 * self.block_size as u64;
        self.skip_entries.push((self.encoder.first_term(), offset));

        let block = self.encoder.finish();
        use std::io::Write;
        self.data_out.write_all(&block)?;
        Ok(())
    }

    /// Finalize the segment with its document sketches and sync both files.
    ///
    /// `docs` are the live doc ids, `tombstones` the doc ids deleted as of
    /// this segment; both must be sorted and disjoint.
    pub fn finish(mut self, docs: &[DocId], tombstones: &[DocId]) -> Result<SegmentInfo> {
        if !self.encoder.is_empty() {
            self.seal_block()?;
        }

        let mut sketches = Vec::new();
        encode_doc_list(&mut sketches, docs);
        encode_doc_list(&mut sketches, tombstones);
        use std::io::Write;
        self.data_out.write_all(&sketches)?;
        self.data_out.close()?;

        let block_count = self.skip_entries.len() as u64;
        let last_key = if block_count == 0 { 0 } else { self.last_key };

        // Skip-index file: entries, then footer (block_count, last_term, crc).
        let mut entries = Vec::with_capacity(self.skip_entries.len() * 12);
        for &(first_term, offset) in &self.skip_entries {
            let mut buf = [0u8; 12];
            LittleEndian::write_u32(&mut buf[..4], first_term);
            LittleEndian::write_u64(&mut buf[4..], offset);
            entries.extend_from_slice(&buf);
        }
        let checksum = crc32fast::hash(&entries);

        let info = SegmentInfo {
            id: self.id,
            block_count,
            last_key,
            checksum,
            doc_count: docs.len() as u32,
        };

        let mut index_out = self.storage.create_output(&info.index_file_name())?;
        index_out.write_all(&entries)?;
        let mut footer = [0u8; 16];
        LittleEndian::write_u64(&mut footer[..8], block_count);
        LittleEndian::write_u32(&mut footer[8..12], last_key);
        LittleEndian::write_u32(&mut footer[12..], checksum);
        index_out.write_all(&footer)?;
        index_out.close()?;

        Ok(info)
    }

    /// Remove the (possibly partial) files of segment `id`, ignoring
    /// missing ones. Used to clean up after a failed flush or merge.
    pub fn discard(storage: &dyn Storage, id: SegmentId) {
        let info = SegmentInfo {
            id,
            block_count: 0,
            last_key: 0,
            checksum: 0,
            doc_count: 0,
        };
        let _ = storage.delete_file(&info.data_file_name());
        let _ = storage.delete_file(&info.index_file_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_write_single_block_segment() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut writer = SegmentWriter::new(storage.clone(), 1, 1024).unwrap();

        for term in [1u32, 2, 3] {
            writer.push(Posting::new(term, 111)).unwrap();
        }
        let info = writer.finish(&[111], &[]).unwrap();

        assert_eq!(info.id, 1);
        assert_eq!(info.block_count, 1);
        assert_eq!(info.last_key, 3);
        assert_eq!(info.doc_count, 1);
        assert!(storage.file_exists("segment_1.fid"));
        assert!(storage.file_exists("segment_1.fii"));

        // Data file holds one padded block plus the two sketches.
        assert!(storage.file_size("segment_1.fid").unwrap() > 1024);
        // Skip index holds one entry plus the footer.
        assert_eq!(storage.file_size("segment_1.fii").unwrap(), 12 + 16);
    }

    #[test]
    fn test_write_multi_block_segment() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut writer = SegmentWriter::new(storage.clone(), 2, 64).unwrap();

        let mut docs = Vec::new();
        for doc_id in 0..100u32 {
            docs.push(doc_id);
        }
        for term in 0..100u32 {
            writer.push(Posting::new(term * 3, term)).unwrap();
        }
        let info = writer.finish(&docs, &[]).unwrap();

        assert!(info.block_count > 1);
        assert_eq!(info.last_key, 99 * 3);
        assert_eq!(
            storage.file_size("segment_2.fii").unwrap(),
            info.block_count * 12 + 16
        );
    }

    #[test]
    fn test_write_empty_segment() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = SegmentWriter::new(storage.clone(), 3, 1024).unwrap();

        // A segment may carry only tombstones.
        let info = writer.finish(&[], &[42]).unwrap();

        assert_eq!(info.block_count, 0);
        assert_eq!(info.last_key, 0);
        assert_eq!(info.doc_count, 0);
    }

    #[test]
    fn test_discard_removes_files() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut writer = SegmentWriter::new(storage.clone(), 4, 1024).unwrap();
        writer.push(Posting::new(1, 1)).unwrap();
        writer.finish(&[1], &[]).unwrap();

        SegmentWriter::discard(storage.as_ref(), 4);
        assert!(!storage.file_exists("segment_4.fid"));
        assert!(!storage.file_exists("segment_4.fii"));
    }
}
