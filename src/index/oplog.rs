//! Durable operation log.
//!
//! Every mutation is appended to `oplog.log` before it touches the in-memory
//! segment. Records are length-prefixed bincode frames protected by a CRC:
//!
//! ```text
//! [payload_len: u32 LE][crc32(payload): u32 LE][payload: bincode(OplogEntry)]
//! ```
//!
//! On startup the log is replayed past the manifest's checkpoint sequence.
//! A torn frame at the tail is the normal signature of a crash mid-append
//! and ends replay; a damaged frame in the middle of the log means lost
//! acknowledged data and fails the open instead of silently dropping it.

use std::io::Read;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwiftletError};
use crate::index::postings::{DocId, Term};
use crate::storage::{Storage, StorageOutput};

/// Name of the oplog file inside an index directory.
pub const OPLOG_FILE: &str = "oplog.log";

/// A single mutation, as recorded in the oplog.
///
/// The same vocabulary doubles as the bulk-operation type consumed by
/// [`Index::apply_batch`](crate::index::Index::apply_batch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Insert or replace a document with the given terms.
    Upsert {
        /// Document id.
        doc_id: DocId,
        /// The document's terms.
        terms: Vec<Term>,
    },
    /// Delete a document.
    Delete {
        /// Document id.
        doc_id: DocId,
    },
    /// Set an index attribute.
    SetAttribute {
        /// Attribute name.
        name: String,
        /// Attribute value.
        value: String,
    },
    /// Marker written after a manifest publication.
    Checkpoint {
        /// The published manifest revision.
        revision: u64,
    },
}

/// One oplog record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// The recorded operation.
    pub op: Op,
}

/// Append-only oplog over a storage backend.
pub struct Oplog {
    storage: Arc<dyn Storage>,
    output: Box<dyn StorageOutput>,
    next_seq: u64,
    sync_writes: bool,
}

impl std::fmt::Debug for Oplog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oplog")
            .field("next_seq", &self.next_seq)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Oplog {
    /// Open the oplog, returning the handle and all decodable entries.
    pub fn open(storage: Arc<dyn Storage>, sync_writes: bool) -> Result<(Oplog, Vec<OplogEntry>)> {
        let entries = Self::read_entries(storage.as_ref())?;
        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(1);
        let output = storage.create_output_append(OPLOG_FILE)?;

        Ok((
            Oplog {
                storage,
                output,
                next_seq,
                sync_writes,
            },
            entries,
        ))
    }

    fn read_entries(storage: &dyn Storage) -> Result<Vec<OplogEntry>> {
        if !storage.file_exists(OPLOG_FILE) {
            return Ok(Vec::new());
        }

        let mut input = storage.open_input(OPLOG_FILE)?;
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;

        let mut entries = Vec::new();
        let mut pos = 0usize;
        let mut last_seq = 0u64;

        while pos < raw.len() {
            if pos + 8 > raw.len() {
                warn!("oplog ends with a torn frame header, ignoring the tail");
                break;
            }
            let len = LittleEndian::read_u32(&raw[pos..pos + 4]) as usize;
            let stored_crc = LittleEndian::read_u32(&raw[pos + 4..pos + 8]);

            if pos + 8 + len > raw.len() {
                warn!("oplog ends with a torn frame payload, ignoring the tail");
                break;
            }
            let payload = &raw[pos + 8..pos + 8 + len];

            if crc32fast::hash(payload) != stored_crc {
                return Err(SwiftletError::corrupt_index(format!(
                    "oplog checksum mismatch at offset {pos}"
                )));
            }
            let entry: OplogEntry = bincode::deserialize(payload).map_err(|e| {
                SwiftletError::corrupt_index(format!("undecodable oplog entry at {pos}: {e}"))
            })?;
            if entry.seq <= last_seq {
                return Err(SwiftletError::corrupt_index(format!(
                    "oplog sequence went backwards at offset {pos}"
                )));
            }
            last_seq = entry.seq;
            entries.push(entry);
            pos += 8 + len;
        }

        Ok(entries)
    }

    fn write_frame(output: &mut dyn StorageOutput, entry: &OplogEntry) -> Result<()> {
        let payload = bincode::serialize(entry)
            .map_err(|e| SwiftletError::storage(format!("oplog encode failed: {e}")))?;

        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[..4], payload.len() as u32);
        LittleEndian::write_u32(&mut header[4..], crc32fast::hash(&payload));
        output.write_all(&header)?;
        output.write_all(&payload)?;
        Ok(())
    }

    /// Append an operation, returning its sequence number.
    pub fn append(&mut self, op: Op) -> Result<u64> {
        let entry = OplogEntry {
            seq: self.next_seq,
            op,
        };
        Self::write_frame(self.output.as_mut(), &entry)?;

        if self.sync_writes {
            self.output.flush_and_sync()?;
        }

        self.next_seq += 1;
        Ok(entry.seq)
    }

    /// Sequence number of the last appended entry, 0 when empty.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Make all appended entries durable.
    pub fn sync(&mut self) -> Result<()> {
        self.output.flush_and_sync()
    }

    /// Drop every entry with `seq <= keep_after`, rewriting the log through
    /// a temporary file so a crash leaves either the old or the new log.
    pub fn truncate(&mut self, keep_after: u64) -> Result<()> {
        self.output.close()?;

        let entries = Self::read_entries(self.storage.as_ref())?;
        let (tmp_name, mut tmp_out) = self.storage.create_temp_output("oplog")?;
        for entry in entries.iter().filter(|e| e.seq > keep_after) {
            Self::write_frame(tmp_out.as_mut(), entry)?;
        }
        tmp_out.close()?;

        self.storage.rename_file(&tmp_name, OPLOG_FILE)?;
        self.storage.sync()?;

        self.output = self.storage.create_output_append(OPLOG_FILE)?;
        Ok(())
    }

    /// Close the log, syncing pending appends.
    pub fn close(&mut self) -> Result<()> {
        self.output.close()
    }
}
