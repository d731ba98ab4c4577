//! Fixed-size posting block codec.
//!
//! A segment data file is a concatenation of fixed-size blocks. Within a
//! block, postings are stored as `(term_delta, doc_id)` varint pairs; the
//! first delta is relative to the base term in the block header:
//!
//! ```text
//! [base_term: u32 LE][count: varint][(delta_term: varint, doc_id: varint) x count]
//! [crc32: u32 LE][zero padding to block size]
//! ```
//!
//! Fixed-size blocks give the skip index random access: one `(first_term,
//! offset)` entry per block is enough to find the block holding any term
//! with a binary search and a single read.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, SwiftletError};
use crate::index::postings::Posting;
use crate::util::varint::{decode_u32, encode_u32, encoded_len_u32, MAX_VARINT32_LEN};

/// Default byte size of a posting block.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

// base_term + worst-case count varint + trailing crc32
const BLOCK_FIXED_OVERHEAD: usize = 4 + MAX_VARINT32_LEN + 4;

/// Incremental encoder for one fixed-size block.
///
/// Postings must be pushed in `(term asc, doc_id asc)` order. The encoder
/// reports when a posting no longer fits so the caller can seal the block
/// and start the next one.
#[derive(Debug)]
pub struct BlockEncoder {
    block_size: usize,
    payload: Vec<u8>,
    base_term: u32,
    last_term: u32,
    count: u32,
}

impl BlockEncoder {
    /// Create an encoder for blocks of the given byte size.
    pub fn new(block_size: usize) -> Self {
        BlockEncoder {
            block_size,
            payload: Vec::with_capacity(block_size),
            base_term: 0,
            last_term: 0,
            count: 0,
        }
    }

    /// Whether the block holds no postings yet.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of postings currently in the block.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// First term of the block; only meaningful when non-empty.
    pub fn first_term(&self) -> u32 {
        self.base_term
    }

    /// Try to add a posting. Returns `false` when the block is full; the
    /// posting is not consumed and must be pushed again after `finish`.
    pub fn try_push(&mut self, posting: Posting) -> bool {
        debug_assert!(
            self.is_empty() || posting.term >= self.last_term,
            "postings must be pushed in order"
        );

        let delta = if self.is_empty() {
            0
        } else {
            posting.term - self.last_term
        };
        let pair_len = encoded_len_u32(delta) + encoded_len_u32(posting.doc_id);

        if !self.is_empty() && BLOCK_FIXED_OVERHEAD + self.payload.len() + pair_len > self.block_size
        {
            return false;
        }

        if self.is_empty() {
            self.base_term = posting.term;
        }
        encode_u32(&mut self.payload, delta);
        encode_u32(&mut self.payload, posting.doc_id);
        self.last_term = posting.term;
        self.count += 1;
        true
    }

    /// Seal the block into exactly `block_size` bytes and reset the encoder.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut block = Vec::with_capacity(self.block_size);
        let mut header = [0u8; 4];
        LittleEndian::write_u32(&mut header, self.base_term);
        block.extend_from_slice(&header);
        encode_u32(&mut block, self.count);
        block.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&block);
        let mut trailer = [0u8; 4];
        LittleEndian::write_u32(&mut trailer, crc);
        block.extend_from_slice(&trailer);

        debug_assert!(block.len() <= self.block_size);
        block.resize(self.block_size, 0);

        self.payload.clear();
        self.base_term = 0;
        self.last_term = 0;
        self.count = 0;

        block
    }
}

/// Decode one block, verifying its checksum.
///
/// Returns the postings in `(term asc, doc_id asc)` order. The caller maps
/// failures to `CorruptSegment` with the file offset it read the block from.
pub fn decode_block(data: &[u8]) -> Result<Vec<Posting>> {
    if data.len() < BLOCK_FIXED_OVERHEAD - MAX_VARINT32_LEN + 1 {
        return Err(SwiftletError::storage("block too short"));
    }

    let base_term = LittleEndian::read_u32(&data[..4]);
    let mut pos = 4;

    let (count, len) = decode_u32(&data[pos..])?;
    pos += len;

    let mut postings = Vec::with_capacity(count as usize);
    let mut term = base_term;
    for i in 0..count {
        let (delta, len) = decode_u32(&data[pos..])?;
        pos += len;
        let (doc_id, len) = decode_u32(&data[pos..])?;
        pos += len;

        // The first pair's delta is relative to the base term itself.
        if i > 0 {
            term = term
                .checked_add(delta)
                .ok_or_else(|| SwiftletError::storage("term delta overflow"))?;
        } else if delta != 0 {
            return Err(SwiftletError::storage("nonzero base delta"));
        }
        postings.push(Posting::new(term, doc_id));
    }

    if pos + 4 > data.len() {
        return Err(SwiftletError::storage("block truncated before checksum"));
    }
    let stored_crc = LittleEndian::read_u32(&data[pos..pos + 4]);
    let actual_crc = crc32fast::hash(&data[..pos]);
    if stored_crc != actual_crc {
        return Err(SwiftletError::storage("block checksum mismatch"));
    }

    Ok(postings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_one(postings: &[Posting], block_size: usize) -> Vec<u8> {
        let mut encoder = BlockEncoder::new(block_size);
        for &p in postings {
            assert!(encoder.try_push(p), "postings must fit in one block");
        }
        encoder.finish()
    }

    #[test]
    fn test_roundtrip() {
        let postings = vec![
            Posting::new(1, 111),
            Posting::new(2, 111),
            Posting::new(3, 111),
            Posting::new(3, 112),
            Posting::new(4, 112),
            Posting::new(5, 112),
        ];

        let block = encode_one(&postings, DEFAULT_BLOCK_SIZE);
        assert_eq!(block.len(), DEFAULT_BLOCK_SIZE);

        let decoded = decode_block(&block).unwrap();
        assert_eq!(decoded, postings);
    }

    #[test]
    fn test_roundtrip_single_posting() {
        let postings = vec![Posting::new(0, 0)];
        let block = encode_one(&postings, 64);
        assert_eq!(decode_block(&block).unwrap(), postings);
    }

    #[test]
    fn test_roundtrip_extreme_values() {
        let postings = vec![
            Posting::new(0, u32::MAX),
            Posting::new(u32::MAX, 0),
            Posting::new(u32::MAX, u32::MAX),
        ];
        let block = encode_one(&postings, 64);
        assert_eq!(decode_block(&block).unwrap(), postings);
    }

    #[test]
    fn test_block_fills_up() {
        let mut encoder = BlockEncoder::new(64);
        let mut pushed = 0u32;

        loop {
            // Large deltas and doc ids force wide varints.
            let posting = Posting::new(pushed * 1_000_000, 3_000_000_000);
            if !encoder.try_push(posting) {
                break;
            }
            pushed += 1;
        }

        assert!(pushed > 0);
        assert_eq!(encoder.count(), pushed);

        let block = encoder.finish();
        assert_eq!(block.len(), 64);
        assert_eq!(decode_block(&block).unwrap().len(), pushed as usize);

        // The encoder is reusable after finish.
        assert!(encoder.is_empty());
        assert!(encoder.try_push(Posting::new(7, 7)));
    }

    #[test]
    fn test_first_posting_always_fits() {
        let mut encoder = BlockEncoder::new(32);
        assert!(encoder.try_push(Posting::new(u32::MAX, u32::MAX)));
    }

    #[test]
    fn test_checksum_mismatch() {
        let block = encode_one(&[Posting::new(1, 1), Posting::new(2, 2)], 64);

        let mut corrupted = block.clone();
        corrupted[5] ^= 0xFF;
        assert!(decode_block(&corrupted).is_err());
    }

    #[test]
    fn test_padding_not_covered_by_checksum() {
        let mut block = encode_one(&[Posting::new(1, 1)], 64);

        // Flipping padding bytes must not affect decoding.
        let len = block.len();
        block[len - 1] ^= 0xFF;
        assert!(decode_block(&block).is_ok());
    }
}
