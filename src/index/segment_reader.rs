//! Segment reader: random access into an immutable on-disk segment.
//!
//! The skip index and the document sketches are loaded eagerly when the
//! segment is opened; posting blocks are read on demand. A reader is shared
//! between searchers through the segment cache, so the underlying data file
//! handle sits behind a mutex.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::error::{Result, SwiftletError};
use crate::index::block::decode_block;
use crate::index::postings::{DocId, Posting, Term};
use crate::index::segment::{decode_doc_list, SegmentInfo};
use crate::storage::{Storage, StorageInput};

/// One skip-index entry: the first term of a block and the block's byte
/// offset in the data file.
#[derive(Debug, Clone, Copy)]
struct SkipEntry {
    first_term: Term,
    offset: u64,
}

/// Reader for one immutable segment.
pub struct SegmentReader {
    info: SegmentInfo,
    block_size: usize,
    skip: Vec<SkipEntry>,
    docs: Vec<DocId>,
    tombstones: Vec<DocId>,
    data: Mutex<Box<dyn StorageInput>>,
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("info", &self.info)
            .field("docs", &self.docs.len())
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}

impl SegmentReader {
    /// Open a segment, loading and verifying the skip index and sketches.
    pub fn open(storage: &dyn Storage, info: &SegmentInfo, block_size: usize) -> Result<Self> {
        let skip = Self::load_skip_index(storage, info)?;

        let sketch_offset = info.block_count * block_size as u64;
        let mut data = storage.open_input(&info.data_file_name())?;
        let data_size = data.size()?;
        if data_size < sketch_offset {
            return Err(SwiftletError::corrupt_segment(info.id, data_size));
        }

        data.seek(SeekFrom::Start(sketch_offset))?;
        let mut tail = Vec::with_capacity((data_size - sketch_offset) as usize);
        data.read_to_end(&mut tail)?;

        let mut pos = 0;
        let docs = decode_doc_list(&tail, &mut pos)
            .map_err(|_| SwiftletError::corrupt_segment(info.id, sketch_offset))?;
        let tombstones = decode_doc_list(&tail, &mut pos)
            .map_err(|_| SwiftletError::corrupt_segment(info.id, sketch_offset + pos as u64))?;

        Ok(SegmentReader {
            info: info.clone(),
            block_size,
            skip,
            docs,
            tombstones,
            data: Mutex::new(data),
        })
    }

    fn load_skip_index(storage: &dyn Storage, info: &SegmentInfo) -> Result<Vec<SkipEntry>> {
        let mut input = storage.open_input(&info.index_file_name())?;
        let size = input.size()?;

        let expected = info.block_count * 12 + 16;
        if size != expected {
            return Err(SwiftletError::corrupt_segment(info.id, size));
        }

        let mut raw = Vec::with_capacity(size as usize);
        input.read_to_end(&mut raw)?;

        let entry_bytes = &raw[..raw.len() - 16];
        let footer = &raw[raw.len() - 16..];
        let block_count = LittleEndian::read_u64(&footer[..8]);
        let last_term = LittleEndian::read_u32(&footer[8..12]);
        let stored_crc = LittleEndian::read_u32(&footer[12..]);

        if block_count != info.block_count
            || last_term != info.last_key
            || stored_crc != info.checksum
            || stored_crc != crc32fast::hash(entry_bytes)
        {
            return Err(SwiftletError::corrupt_segment(
                info.id,
                (raw.len() - 16) as u64,
            ));
        }

        let mut skip = Vec::with_capacity(block_count as usize);
        for chunk in entry_bytes.chunks_exact(12) {
            skip.push(SkipEntry {
                first_term: LittleEndian::read_u32(&chunk[..4]),
                offset: LittleEndian::read_u64(&chunk[4..]),
            });
        }

        Ok(skip)
    }

    /// Segment metadata.
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// First term of the segment, if it has any postings.
    pub fn first_key(&self) -> Option<Term> {
        self.skip.first().map(|e| e.first_term)
    }

    /// Sorted ids of documents live in this segment.
    pub fn docs(&self) -> &[DocId] {
        &self.docs
    }

    /// Sorted ids of documents deleted as of this segment.
    pub fn tombstones(&self) -> &[DocId] {
        &self.tombstones
    }

    /// Whether the document is live in this segment.
    pub fn contains_doc(&self, doc_id: DocId) -> bool {
        self.docs.binary_search(&doc_id).is_ok()
    }

    /// Whether the document is tombstoned in this segment.
    pub fn is_tombstoned(&self, doc_id: DocId) -> bool {
        self.tombstones.binary_search(&doc_id).is_ok()
    }

    /// Whether any postings with a term in `[lo, hi]` can exist here.
    pub fn contains_term_range(&self, lo: Term, hi: Term) -> bool {
        match self.first_key() {
            Some(first) => first <= hi && lo <= self.info.last_key,
            None => false,
        }
    }

    /// Read and decode the block at `block_index`.
    fn read_block(&self, block_index: u64) -> Result<Vec<Posting>> {
        let offset = self.skip[block_index as usize].offset;
        let mut buf = vec![0u8; self.block_size];
        {
            let mut data = self.data.lock();
            data.seek(SeekFrom::Start(offset))?;
            data.read_exact(&mut buf)?;
        }
        decode_block(&buf).map_err(|e| match e {
            SwiftletError::Io(e) => SwiftletError::Io(e),
            _ => SwiftletError::corrupt_segment(self.info.id, offset),
        })
    }

    /// Index of the first block that may contain `term`.
    fn start_block(&self, term: Term) -> u64 {
        // The block before the first entry with first_term >= term may still
        // hold postings for the term; a run of equal first_term entries means
        // the term spans several blocks.
        let idx = self.skip.partition_point(|e| e.first_term < term);
        idx.saturating_sub(1) as u64
    }

    /// All doc ids with postings for `term`, in ascending order.
    ///
    /// Each doc id is yielded at most once: the writer stores one posting per
    /// distinct `(term, doc)` pair.
    pub fn find(&self, term: Term) -> Result<Vec<DocId>> {
        if !self.contains_term_range(term, term) {
            return Ok(Vec::new());
        }

        let mut doc_ids = Vec::new();
        let mut block_index = self.start_block(term);

        while block_index < self.info.block_count {
            if self.skip[block_index as usize].first_term > term {
                break;
            }

            let postings = self.read_block(block_index)?;
            let mut past_term = false;
            for posting in &postings {
                if posting.term == term {
                    doc_ids.push(posting.doc_id);
                } else if posting.term > term {
                    past_term = true;
                    break;
                }
            }
            if past_term {
                break;
            }
            block_index += 1;
        }

        Ok(doc_ids)
    }

}

/// Streaming cursor over a term range of one segment.
///
/// Used by the merger; loads one block at a time.
pub struct SegmentCursor {
    reader: Arc<SegmentReader>,
    lo: Term,
    hi: Term,
    next_block: u64,
    buf: Vec<Posting>,
    pos: usize,
}

impl SegmentCursor {
    /// Cursor over all postings of `reader` with terms in `[lo, hi]`, in
    /// posting order.
    pub fn range(reader: Arc<SegmentReader>, lo: Term, hi: Term) -> SegmentCursor {
        let next_block = if reader.skip.is_empty() {
            0
        } else {
            reader
                .skip
                .partition_point(|e| e.first_term < lo)
                .saturating_sub(1) as u64
        };

        SegmentCursor {
            reader,
            lo,
            hi,
            next_block,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Cursor over every posting of `reader`.
    pub fn over(reader: Arc<SegmentReader>) -> SegmentCursor {
        Self::range(reader, 0, Term::MAX)
    }

    /// Advance to the next posting in range, or `None` when exhausted.
    pub fn next(&mut self) -> Result<Option<Posting>> {
        loop {
            while self.pos < self.buf.len() {
                let posting = self.buf[self.pos];
                self.pos += 1;

                if posting.term < self.lo {
                    continue;
                }
                if posting.term > self.hi {
                    return Ok(None);
                }
                return Ok(Some(posting));
            }

            if self.next_block >= self.reader.info.block_count {
                return Ok(None);
            }
            if self.reader.skip[self.next_block as usize].first_term > self.hi {
                return Ok(None);
            }

            self.buf = self.reader.read_block(self.next_block)?;
            self.pos = 0;
            self.next_block += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment_writer::SegmentWriter;
    use crate::storage::{MemoryStorage, StorageOutput};

    fn build_segment(
        storage: &Arc<dyn Storage>,
        id: u32,
        block_size: usize,
        postings: &[Posting],
        docs: &[DocId],
        tombstones: &[DocId],
    ) -> SegmentInfo {
        let mut writer = SegmentWriter::new(storage.clone(), id, block_size).unwrap();
        for &p in postings {
            writer.push(p).unwrap();
        }
        writer.finish(docs, tombstones).unwrap()
    }

    #[test]
    fn test_find_in_single_block() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let postings = vec![
            Posting::new(1, 111),
            Posting::new(2, 111),
            Posting::new(3, 111),
            Posting::new(3, 112),
            Posting::new(4, 112),
            Posting::new(5, 112),
        ];
        let info = build_segment(&storage, 1, 1024, &postings, &[111, 112], &[]);
        let reader = SegmentReader::open(storage.as_ref(), &info, 1024).unwrap();

        assert_eq!(reader.find(1).unwrap(), vec![111]);
        assert_eq!(reader.find(3).unwrap(), vec![111, 112]);
        assert_eq!(reader.find(5).unwrap(), vec![112]);
        assert_eq!(reader.find(6).unwrap(), Vec::<DocId>::new());
        assert_eq!(reader.find(0).unwrap(), Vec::<DocId>::new());
    }

    #[test]
    fn test_find_across_blocks() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        // One term shared by many docs spans multiple 64-byte blocks.
        let mut postings = vec![Posting::new(10, 1)];
        for doc_id in 0..200u32 {
            postings.push(Posting::new(500, doc_id * 7));
        }
        postings.push(Posting::new(900, 3));
        let docs: Vec<DocId> = {
            let mut d: Vec<DocId> = postings.iter().map(|p| p.doc_id).collect();
            d.sort_unstable();
            d.dedup();
            d
        };
        let info = build_segment(&storage, 1, 64, &postings, &docs, &[]);
        assert!(info.block_count > 1);

        let reader = SegmentReader::open(storage.as_ref(), &info, 64).unwrap();

        let found = reader.find(500).unwrap();
        assert_eq!(found.len(), 200);
        assert_eq!(found[0], 0);
        assert_eq!(found[199], 199 * 7);

        assert_eq!(reader.find(10).unwrap(), vec![1]);
        assert_eq!(reader.find(900).unwrap(), vec![3]);
        assert_eq!(reader.find(499).unwrap(), Vec::<DocId>::new());
    }

    #[test]
    fn test_term_range_and_sketches() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let postings = vec![Posting::new(7, 1), Posting::new(9, 2)];
        let info = build_segment(&storage, 1, 1024, &postings, &[1, 2], &[5]);
        let reader = SegmentReader::open(storage.as_ref(), &info, 1024).unwrap();

        assert!(reader.contains_term_range(0, 7));
        assert!(reader.contains_term_range(8, 8));
        assert!(!reader.contains_term_range(10, 100));
        assert!(!reader.contains_term_range(0, 6));

        assert!(reader.contains_doc(1));
        assert!(!reader.contains_doc(5));
        assert!(reader.is_tombstoned(5));
        assert!(!reader.is_tombstoned(1));
    }

    #[test]
    fn test_segment_with_term_zero() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let postings = vec![Posting::new(0, 42)];
        let info = build_segment(&storage, 1, 1024, &postings, &[42], &[]);
        assert_eq!(info.last_key, 0);

        let reader = SegmentReader::open(storage.as_ref(), &info, 1024).unwrap();
        assert_eq!(reader.find(0).unwrap(), vec![42]);
        assert!(reader.contains_term_range(0, 0));
    }

    #[test]
    fn test_cursor_full_scan() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut postings = Vec::new();
        for term in 0..300u32 {
            postings.push(Posting::new(term, term % 5));
        }
        let info = build_segment(&storage, 1, 64, &postings, &[0, 1, 2, 3, 4], &[]);
        let reader = Arc::new(SegmentReader::open(storage.as_ref(), &info, 64).unwrap());

        let mut cursor = SegmentCursor::over(Arc::clone(&reader));
        let mut collected = Vec::new();
        while let Some(p) = cursor.next().unwrap() {
            collected.push(p);
        }
        assert_eq!(collected, postings);
    }

    #[test]
    fn test_cursor_range() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut postings = Vec::new();
        for term in 0..300u32 {
            postings.push(Posting::new(term, 1));
        }
        let info = build_segment(&storage, 1, 64, &postings, &[1], &[]);
        let reader = Arc::new(SegmentReader::open(storage.as_ref(), &info, 64).unwrap());

        let mut cursor = SegmentCursor::range(Arc::clone(&reader), 100, 110);
        let mut terms = Vec::new();
        while let Some(p) = cursor.next().unwrap() {
            terms.push(p.term);
        }
        assert_eq!(terms, (100..=110).collect::<Vec<_>>());
    }

    #[test]
    fn test_corrupt_skip_index() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let info = build_segment(&storage, 1, 1024, &[Posting::new(1, 1)], &[1], &[]);

        // Damage a skip entry; the footer checksum must catch it.
        let mut raw = Vec::new();
        storage
            .open_input("segment_1.fii")
            .unwrap()
            .read_to_end(&mut raw)
            .unwrap();
        raw[0] ^= 0xFF;
        let mut out = storage.create_output("segment_1.fii").unwrap();
        use std::io::Write;
        out.write_all(&raw).unwrap();
        out.close().unwrap();

        match SegmentReader::open(storage.as_ref(), &info, 1024) {
            Err(SwiftletError::CorruptSegment { segment_id, .. }) => assert_eq!(segment_id, 1),
            other => panic!("expected CorruptSegment, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_block() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let info = build_segment(&storage, 1, 1024, &[Posting::new(1, 1)], &[1], &[]);

        let mut raw = Vec::new();
        storage
            .open_input("segment_1.fid")
            .unwrap()
            .read_to_end(&mut raw)
            .unwrap();
        raw[5] ^= 0xFF;
        let mut out = storage.create_output("segment_1.fid").unwrap();
        use std::io::Write;
        out.write_all(&raw).unwrap();
        out.close().unwrap();

        let reader = SegmentReader::open(storage.as_ref(), &info, 1024).unwrap();
        match reader.find(1) {
            Err(SwiftletError::CorruptSegment { segment_id, offset }) => {
                assert_eq!(segment_id, 1);
                assert_eq!(offset, 0);
            }
            other => panic!("expected CorruptSegment, got {other:?}"),
        }
    }
}
