//! Mutation path of the index: upserts, deletes, flush and merge.
//!
//! All mutations serialize through the writer (mutation) lock and reach the
//! oplog before the in-memory segment, so an acknowledged write is always
//! recoverable. The lock is never held across segment I/O: a flush freezes
//! the buffer under the lock, encodes the segment without it, and retakes it
//! only for the manifest swap. Merges follow the same discipline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{info, warn};

use crate::error::{Result, SwiftletError};
use crate::index::index::Index;
use crate::index::manifest::Manifest;
use crate::index::memory_segment::MemorySegment;
use crate::index::merger::merge_segments;
use crate::index::oplog::Op;
use crate::index::postings::{DocId, SegmentId, Term};
use crate::index::segment::SegmentInfo;
use crate::index::segment_writer::SegmentWriter;

impl Index {
    /// Insert or replace a document, returning the new revision.
    pub fn upsert(&self, doc_id: DocId, terms: &[Term]) -> Result<u64> {
        self.check_closed()?;

        let revision;
        let should_flush;
        {
            let mut writer = self.writer.lock();
            writer.oplog.append(Op::Upsert {
                doc_id,
                terms: terms.to_vec(),
            })?;
            let mut memory = self.memory.write();
            Arc::make_mut(&mut *memory).upsert(doc_id, terms);
            should_flush = memory.approximate_bytes() >= self.config.flush_threshold_bytes;
            revision = self.bump_revision();
        }

        if should_flush {
            self.flush()?;
        }
        Ok(revision)
    }

    /// Delete a document, returning the new revision. Deleting an absent
    /// document is recorded all the same; the tombstone is harmless.
    pub fn delete(&self, doc_id: DocId) -> Result<u64> {
        self.check_closed()?;

        let mut writer = self.writer.lock();
        writer.oplog.append(Op::Delete { doc_id })?;
        let mut memory = self.memory.write();
        Arc::make_mut(&mut *memory).delete(doc_id);
        Ok(self.bump_revision())
    }

    /// Set an index attribute, returning the new revision. The value is
    /// staged and becomes part of the manifest at the next publication.
    pub fn set_attribute(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<u64> {
        self.check_closed()?;

        let name = name.into();
        let value = value.into();

        let mut writer = self.writer.lock();
        writer.oplog.append(Op::SetAttribute {
            name: name.clone(),
            value: value.clone(),
        })?;
        self.staged_attrs.lock().insert(name, value);
        Ok(self.bump_revision())
    }

    /// Apply a batch of operations under one mutation-lock hold.
    ///
    /// The batch is validated up front, so a malformed operation rejects the
    /// whole request before anything is applied. Returns the revision after
    /// the last operation.
    pub fn apply_batch(&self, ops: &[Op]) -> Result<u64> {
        self.check_closed()?;

        for op in ops {
            if matches!(op, Op::Checkpoint { .. }) {
                return Err(SwiftletError::invalid_argument(
                    "checkpoint is not a client operation",
                ));
            }
        }

        let mut revision = self.revision();
        let should_flush;
        {
            let mut writer = self.writer.lock();
            for op in ops {
                writer.oplog.append(op.clone())?;
                match op {
                    Op::Upsert { doc_id, terms } => {
                        let mut memory = self.memory.write();
                        Arc::make_mut(&mut *memory).upsert(*doc_id, terms);
                    }
                    Op::Delete { doc_id } => {
                        let mut memory = self.memory.write();
                        Arc::make_mut(&mut *memory).delete(*doc_id);
                    }
                    Op::SetAttribute { name, value } => {
                        self.staged_attrs.lock().insert(name.clone(), value.clone());
                    }
                    Op::Checkpoint { .. } => unreachable!("rejected above"),
                }
                revision = self.bump_revision();
            }
            should_flush =
                self.memory.read().approximate_bytes() >= self.config.flush_threshold_bytes;
        }

        if should_flush {
            self.flush()?;
        }
        Ok(revision)
    }

    /// Persist the in-memory segment as an on-disk segment and publish a new
    /// manifest revision. A flush with nothing to persist still checkpoints
    /// staged attributes; a fully idle flush publishes nothing.
    pub fn flush(&self) -> Result<u64> {
        self.check_closed()?;
        let _flush_guard = self.flush_lock.lock();

        // Freeze the buffer and reserve a segment id under the mutation lock.
        // The frozen pointer is published while the buffer lock is still
        // held, so no searcher can observe the empty buffer without also
        // seeing the frozen one.
        let (frozen, checkpoint_seq, segment_id) = {
            let mut writer = self.writer.lock();
            let mut memory = self.memory.write();
            let frozen = if memory.is_empty() {
                None
            } else {
                let current = Arc::clone(&*memory);
                *self.frozen.write() = Some(Arc::clone(&current));
                *memory = Arc::new(MemorySegment::new());
                Some(current)
            };
            drop(memory);
            let segment_id = frozen.as_ref().map(|_| {
                let id = writer.next_segment_id;
                writer.next_segment_id += 1;
                id
            });
            (frozen, writer.oplog.last_seq(), segment_id)
        };

        // Nothing new since the last publication: leave the manifest alone.
        if frozen.is_none()
            && self.staged_attrs.lock().is_empty()
            && checkpoint_seq == self.manifest.read().checkpoint_seq
        {
            return Ok(self.revision());
        }

        // Encode the segment without holding the mutation lock; searchers
        // keep seeing the frozen buffer meanwhile.
        let new_segment = match (&frozen, segment_id) {
            (Some(buffer), Some(id)) => match self.write_segment(buffer, id) {
                Ok(info) => Some(info),
                Err(e) => {
                    self.restore_frozen(buffer);
                    SegmentWriter::discard(self.storage.as_ref(), id);
                    return Err(e);
                }
            },
            _ => None,
        };

        // Publish under the mutation lock.
        let mut writer = self.writer.lock();
        let old_manifest = Manifest::clone_handle(&self.manifest);
        let revision = self.revision.load(Ordering::Acquire) + 1;

        let mut manifest = (*old_manifest).clone();
        manifest.revision = revision;
        manifest.checkpoint_seq = checkpoint_seq;
        if let Some(info) = &new_segment {
            manifest.segments.push(info.clone());
        }
        let staged = std::mem::take(&mut *self.staged_attrs.lock());
        manifest.attributes.extend(staged.clone());

        if let Err(e) = manifest.write(self.storage.as_ref()) {
            // The old manifest remains authoritative.
            *self.staged_attrs.lock() = staged;
            if let (Some(buffer), Some(id)) = (&frozen, segment_id) {
                self.restore_frozen(buffer);
                SegmentWriter::discard(self.storage.as_ref(), id);
            }
            return Err(e);
        }

        self.revision.store(revision, Ordering::Release);
        *self.manifest.write() = Arc::new(manifest);
        *self.frozen.write() = None;

        // Checkpoint the oplog; a crash before the truncate lands on a
        // benign, idempotent replay.
        writer.oplog.append(Op::Checkpoint { revision })?;
        writer.oplog.truncate(checkpoint_seq)?;
        drop(writer);

        let _ = self
            .storage
            .delete_file(&Manifest::file_name(old_manifest.revision));

        if let Some(info) = &new_segment {
            info!(
                "index '{}': flushed segment {} ({} blocks, {} docs) at revision {revision}",
                self.name, info.id, info.block_count, info.doc_count
            );
        }

        if self.config.merge_enabled {
            while self.maybe_merge()? {}
        }
        Ok(revision)
    }

    fn write_segment(&self, buffer: &MemorySegment, id: SegmentId) -> Result<SegmentInfo> {
        let mut writer = SegmentWriter::new(Arc::clone(&self.storage), id, self.config.block_size)?;
        for posting in buffer.postings() {
            writer.push(posting)?;
        }
        writer.finish(&buffer.doc_ids(), &buffer.tombstone_ids())
    }

    /// Fold a frozen buffer back into the live one after a failed flush.
    /// Only documents the live buffer knows nothing newer about are
    /// restored; everything is still covered by the untruncated oplog.
    fn restore_frozen(&self, buffer: &MemorySegment) {
        let mut guard = self.memory.write();
        let memory = Arc::make_mut(&mut *guard);

        for (doc_id, terms) in buffer.docs_with_terms() {
            if !memory.contains_doc(doc_id) && !memory.is_tombstoned(doc_id) {
                memory.upsert(doc_id, terms);
            }
        }
        for doc_id in buffer.tombstone_ids() {
            if !memory.contains_doc(doc_id) && !memory.is_tombstoned(doc_id) {
                memory.delete(doc_id);
            }
        }

        *self.frozen.write() = None;
    }

    /// Evaluate the merge policy and run at most one merge. Returns whether
    /// a merge was performed.
    pub fn maybe_merge(&self) -> Result<bool> {
        self.check_closed()?;
        if !self.config.merge_enabled {
            return Ok(false);
        }

        let selected = {
            let manifest = self.manifest.read();
            self.merge_policy.select_merge(&manifest.segments)
        };
        match selected {
            Some(ids) => self.merge(&ids),
            None => Ok(false),
        }
    }

    /// Merge every live segment into one. Flushes first so the result holds
    /// the whole index.
    pub fn optimize(&self) -> Result<bool> {
        self.check_closed()?;
        self.flush()?;

        let ids: Vec<SegmentId> = {
            let manifest = self.manifest.read();
            manifest.segments.iter().map(|s| s.id).collect()
        };
        if ids.len() < 2 {
            return Ok(false);
        }
        self.merge(&ids)
    }

    fn merge(&self, ids: &[SegmentId]) -> Result<bool> {
        // One merge per index at a time.
        if self.merge_active.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = self.merge_inner(ids);
        self.merge_active.store(false, Ordering::Release);
        result
    }

    fn merge_inner(&self, ids: &[SegmentId]) -> Result<bool> {
        let snapshot = Manifest::clone_handle(&self.manifest);
        let infos: Vec<SegmentInfo> = snapshot
            .segments
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect();
        if infos.len() != ids.len() || infos.len() < 2 {
            return Ok(false);
        }

        let readers = infos
            .iter()
            .map(|info| self.open_reader(info))
            .collect::<Result<Vec<_>>>()?;
        let output_id = {
            let mut writer = self.writer.lock();
            let id = writer.next_segment_id;
            writer.next_segment_id += 1;
            id
        };

        // The merge itself runs without any index lock. A panic inside it is
        // contained: the merge is dropped and no manifest change happens.
        let merged = catch_unwind(AssertUnwindSafe(|| {
            merge_segments(&self.storage, &readers, output_id, self.config.block_size)
        }));
        let info = match merged {
            Err(_) => {
                warn!(
                    "index '{}': merge of segments {ids:?} panicked, dropping the merge",
                    self.name
                );
                SegmentWriter::discard(self.storage.as_ref(), output_id);
                return Ok(false);
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(info)) => info,
        };

        // Swap under the mutation lock.
        let mut writer = self.writer.lock();
        if self.closed.load(Ordering::Acquire) {
            SegmentWriter::discard(self.storage.as_ref(), output_id);
            return Ok(false);
        }

        let old_manifest = Manifest::clone_handle(&self.manifest);
        let start = match old_manifest.segments.iter().position(|s| s.id == ids[0]) {
            Some(start) => start,
            None => {
                SegmentWriter::discard(self.storage.as_ref(), output_id);
                return Ok(false);
            }
        };
        let run_intact = old_manifest.segments.len() >= start + ids.len()
            && old_manifest.segments[start..start + ids.len()]
                .iter()
                .map(|s| s.id)
                .eq(ids.iter().copied());
        if !run_intact {
            SegmentWriter::discard(self.storage.as_ref(), output_id);
            return Ok(false);
        }

        let revision = self.revision.load(Ordering::Acquire) + 1;
        let mut manifest = (*old_manifest).clone();
        manifest.revision = revision;
        manifest
            .segments
            .splice(start..start + ids.len(), [info.clone()]);
        let staged = std::mem::take(&mut *self.staged_attrs.lock());
        manifest.attributes.extend(staged.clone());

        if let Err(e) = manifest.write(self.storage.as_ref()) {
            *self.staged_attrs.lock() = staged;
            SegmentWriter::discard(self.storage.as_ref(), output_id);
            return Err(e);
        }

        self.revision.store(revision, Ordering::Release);
        *self.manifest.write() = Arc::new(manifest);
        writer.oplog.append(Op::Checkpoint { revision })?;
        drop(writer);

        // Retire the inputs. Readers still holding the old segments keep
        // them alive through their own handles; new snapshots no longer see
        // them.
        for input in &infos {
            self.cache.evict(&self.name, input.id);
            let _ = self.storage.delete_file(&input.data_file_name());
            let _ = self.storage.delete_file(&input.index_file_name());
        }
        let _ = self
            .storage
            .delete_file(&Manifest::file_name(old_manifest.revision));

        info!(
            "index '{}': merged segments {ids:?} into segment {} ({} docs) at revision {revision}",
            self.name, info.id, info.doc_count
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, SearchOptions};
    use crate::index::merge_policy::NoMergePolicy;
    use crate::storage::{MemoryStorage, Storage};

    fn memory_index() -> Index {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        Index::create("main", storage, IndexConfig::default()).unwrap()
    }

    #[test]
    fn test_revisions_are_monotonic() {
        let index = memory_index();

        let r1 = index.upsert(1, &[1]).unwrap();
        let r2 = index.upsert(2, &[2]).unwrap();
        let r3 = index.delete(1).unwrap();
        let r4 = index.set_attribute("a", "b").unwrap();
        let r5 = index.flush().unwrap();

        assert!(r1 < r2 && r2 < r3 && r3 < r4 && r4 < r5);
        assert_eq!(index.revision(), r5);
    }

    #[test]
    fn test_flush_creates_segment_and_truncates_oplog() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let index = Index::create("main", Arc::clone(&storage), IndexConfig::default()).unwrap();

        index.upsert(111, &[1, 2, 3]).unwrap();
        index.upsert(112, &[3, 4, 5]).unwrap();
        index.flush().unwrap();

        assert!(storage.file_exists("segment_1.fid"));
        assert!(storage.file_exists("segment_1.fii"));
        assert_eq!(index.stats().segment_count, 1);
        assert_eq!(index.memory.read().doc_count(), 0);

        // The oplog kept only the checkpoint record.
        let (oplog, entries) =
            crate::index::oplog::Oplog::open(Arc::clone(&storage), true).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].op, Op::Checkpoint { .. }));
        drop(oplog);
    }

    #[test]
    fn test_idle_flush_publishes_nothing() {
        let index = memory_index();
        index.upsert(1, &[1]).unwrap();
        let r1 = index.flush().unwrap();
        let r2 = index.flush().unwrap();

        assert_eq!(r1, r2);
        assert_eq!(index.stats().segment_count, 1);
    }

    #[test]
    fn test_flush_threshold_triggers_auto_flush() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = IndexConfig {
            flush_threshold_bytes: 256,
            ..Default::default()
        };
        let index = Index::create("main", storage, config).unwrap();

        for doc_id in 0..64 {
            index.upsert(doc_id, &[doc_id, doc_id + 1, doc_id + 2]).unwrap();
        }

        assert!(index.stats().segment_count >= 1);
        assert!(index.memory.read().approximate_bytes() < 256);
    }

    #[test]
    fn test_merge_consolidates_small_segments() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = IndexConfig {
            merge_min: 2,
            ..Default::default()
        };
        let index = Index::create("main", Arc::clone(&storage), config).unwrap();

        for doc_id in 0..4u32 {
            index.upsert(doc_id, &[doc_id * 10, doc_id * 10 + 1]).unwrap();
            index.flush().unwrap();
        }

        // The tiered policy repeatedly folded same-sized runs together.
        assert!(index.stats().segment_count < 4);

        // Every document still answers.
        for doc_id in 0..4u32 {
            let results = index
                .search(&[doc_id * 10, doc_id * 10 + 1], &SearchOptions::default())
                .unwrap();
            assert_eq!(results[0].doc_id, doc_id);
            assert_eq!(results[0].score, 2);
        }
    }

    #[test]
    fn test_no_merge_policy_keeps_segments() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let index = Index::create_with_policy(
            "main",
            storage,
            IndexConfig::default(),
            Box::new(NoMergePolicy),
        )
        .unwrap();

        for doc_id in 0..5u32 {
            index.upsert(doc_id, &[doc_id]).unwrap();
            index.flush().unwrap();
        }

        assert_eq!(index.stats().segment_count, 5);
    }

    #[test]
    fn test_optimize_collapses_to_one_segment() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let index = Index::create_with_policy(
            "main",
            Arc::clone(&storage),
            IndexConfig::default(),
            Box::new(NoMergePolicy),
        )
        .unwrap();

        for doc_id in 0..5u32 {
            index.upsert(doc_id, &[doc_id, 100]).unwrap();
            index.flush().unwrap();
        }
        assert_eq!(index.stats().segment_count, 5);

        assert!(index.optimize().unwrap());
        assert_eq!(index.stats().segment_count, 1);

        let results = index.search(&[100], &SearchOptions::default()).unwrap();
        assert_eq!(results.len(), 5);

        // Input files are gone, the merged segment remains.
        assert!(!storage.file_exists("segment_1.fid"));
        assert!(storage.file_exists("segment_6.fid"));
    }

    #[test]
    fn test_apply_batch_all_or_nothing_validation() {
        let index = memory_index();
        index.upsert(112, &[1]).unwrap();
        index.upsert(113, &[2]).unwrap();

        let ops = vec![
            Op::Upsert {
                doc_id: 111,
                terms: vec![1, 2, 3],
            },
            Op::Upsert {
                doc_id: 112,
                terms: vec![3, 4, 5],
            },
            Op::Delete { doc_id: 113 },
            Op::SetAttribute {
                name: "foo".to_string(),
                value: "bar".to_string(),
            },
        ];
        index.apply_batch(&ops).unwrap();

        assert!(index.contains_document(111).unwrap());
        assert!(index.contains_document(112).unwrap());
        assert!(!index.contains_document(113).unwrap());
        assert_eq!(index.attribute("foo").as_deref(), Some("bar"));

        // A batch containing an internal op is rejected up front.
        let bad = vec![
            Op::Delete { doc_id: 111 },
            Op::Checkpoint { revision: 1 },
        ];
        assert!(index.apply_batch(&bad).is_err());
        assert!(index.contains_document(111).unwrap());
    }
}
