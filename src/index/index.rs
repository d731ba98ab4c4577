//! Index management and coordination.
//!
//! An [`Index`] owns one in-memory segment, one manifest, one oplog and a
//! handle to the shared segment-reader cache. Readers take cheap snapshots;
//! all mutations serialize through the writer lock (see
//! [`writer`](crate::index::writer) for the mutation half).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, RwLock};

use crate::config::{IndexConfig, SearchOptions};
use crate::error::{Result, SwiftletError};
use crate::index::manifest::Manifest;
use crate::index::memory_segment::MemorySegment;
use crate::index::merge_policy::{MergePolicy, TieredMergePolicy};
use crate::index::oplog::{Op, Oplog, OplogEntry};
use crate::index::postings::{DocId, SegmentId, Term};
use crate::index::segment::SegmentInfo;
use crate::index::segment_cache::SegmentReaderCache;
use crate::index::segment_reader::SegmentReader;
use crate::search::results::SearchResult;
use crate::search::searcher;
use crate::storage::Storage;

/// Point-in-time statistics for one index.
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Sum of live doc counts across segments and the write buffer; an
    /// upper bound since a document may appear in several segments.
    pub doc_count_estimate: u64,
    /// Number of live on-disk segments.
    pub segment_count: usize,
    /// Approximate footprint of the in-memory segment.
    pub memory_segment_bytes: usize,
    /// Current revision.
    pub revision: u64,
}

/// Mutable writer-side state, guarded by the mutation lock.
pub(crate) struct WriterState {
    pub(crate) oplog: Oplog,
    pub(crate) next_segment_id: SegmentId,
}

/// A single fingerprint index.
pub struct Index {
    pub(crate) name: String,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) config: IndexConfig,
    pub(crate) cache: Arc<SegmentReaderCache>,
    pub(crate) merge_policy: Box<dyn MergePolicy>,

    /// Current write buffer; replaced copy-on-write so searchers can snapshot
    /// it without blocking writers.
    pub(crate) memory: RwLock<Arc<MemorySegment>>,
    /// Buffer frozen by an in-flight flush, still visible to searches as the
    /// second-newest segment.
    pub(crate) frozen: RwLock<Option<Arc<MemorySegment>>>,
    /// Published manifest.
    pub(crate) manifest: RwLock<Arc<Manifest>>,
    /// Attribute changes accepted since the last manifest publication.
    pub(crate) staged_attrs: Mutex<BTreeMap<String, String>>,

    /// The exclusive mutation lock.
    pub(crate) writer: Mutex<WriterState>,
    /// Serializes flushes; held across segment I/O, unlike the writer lock.
    pub(crate) flush_lock: Mutex<()>,
    /// At most one merge runs per index.
    pub(crate) merge_active: AtomicBool,

    pub(crate) revision: AtomicU64,
    pub(crate) closed: AtomicBool,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("revision", &self.revision.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Index {
    /// Open an existing index, creating it if absent.
    pub fn create(
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        config: IndexConfig,
    ) -> Result<Index> {
        let cache = Arc::new(SegmentReaderCache::new(config.max_open_segments));
        let policy = Box::new(TieredMergePolicy::new(config.merge_min));
        Self::open_internal(name.into(), storage, config, cache, policy, true)
    }

    /// Open an existing index; fails with `NotFound` when it does not exist.
    pub fn open(
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        config: IndexConfig,
    ) -> Result<Index> {
        let cache = Arc::new(SegmentReaderCache::new(config.max_open_segments));
        let policy = Box::new(TieredMergePolicy::new(config.merge_min));
        Self::open_internal(name.into(), storage, config, cache, policy, false)
    }

    /// Open or create an index with a custom merge policy.
    pub fn create_with_policy(
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        config: IndexConfig,
        policy: Box<dyn MergePolicy>,
    ) -> Result<Index> {
        let cache = Arc::new(SegmentReaderCache::new(config.max_open_segments));
        Self::open_internal(name.into(), storage, config, cache, policy, true)
    }

    pub(crate) fn open_internal(
        name: String,
        storage: Arc<dyn Storage>,
        config: IndexConfig,
        cache: Arc<SegmentReaderCache>,
        merge_policy: Box<dyn MergePolicy>,
        create: bool,
    ) -> Result<Index> {
        config.validate()?;

        let manifest = match Manifest::load_latest(storage.as_ref())? {
            Some(manifest) => manifest,
            None if create => {
                let manifest = Manifest::default();
                manifest.write(storage.as_ref())?;
                manifest
            }
            None => return Err(SwiftletError::not_found("index", name)),
        };
        manifest.gc_stale_files(storage.as_ref());

        let (oplog, entries) = Oplog::open(Arc::clone(&storage), config.sync_oplog)?;
        let (memory, staged_attrs, replayed) = Self::replay(&manifest, &entries);
        if replayed > 0 {
            info!(
                "index '{name}': replayed {replayed} oplog entries past checkpoint {}",
                manifest.checkpoint_seq
            );
        }

        let next_segment_id = manifest
            .segments
            .iter()
            .map(|s| s.id)
            .max()
            .map(|id| id + 1)
            .unwrap_or(1);
        let revision = manifest.revision + replayed;

        info!(
            "opened index '{name}' at revision {revision} with {} segments",
            manifest.segments.len()
        );

        Ok(Index {
            name,
            storage,
            config,
            cache,
            merge_policy,
            memory: RwLock::new(Arc::new(memory)),
            frozen: RwLock::new(None),
            manifest: RwLock::new(Arc::new(manifest)),
            staged_attrs: Mutex::new(staged_attrs),
            writer: Mutex::new(WriterState {
                oplog,
                next_segment_id,
            }),
            flush_lock: Mutex::new(()),
            merge_active: AtomicBool::new(false),
            revision: AtomicU64::new(revision),
            closed: AtomicBool::new(false),
        })
    }

    /// Re-apply oplog entries newer than the manifest checkpoint.
    fn replay(
        manifest: &Manifest,
        entries: &[OplogEntry],
    ) -> (MemorySegment, BTreeMap<String, String>, u64) {
        let mut memory = MemorySegment::new();
        let mut staged_attrs = BTreeMap::new();
        let mut replayed = 0u64;

        for entry in entries {
            if entry.seq <= manifest.checkpoint_seq {
                continue;
            }
            match &entry.op {
                Op::Upsert { doc_id, terms } => {
                    memory.upsert(*doc_id, terms);
                    replayed += 1;
                }
                Op::Delete { doc_id } => {
                    memory.delete(*doc_id);
                    replayed += 1;
                }
                Op::SetAttribute { name, value } => {
                    staged_attrs.insert(name.clone(), value.clone());
                    replayed += 1;
                }
                Op::Checkpoint { .. } => {}
            }
        }

        (memory, staged_attrs, replayed)
    }

    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(SwiftletError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn bump_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Name of the index.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current revision, advanced by every mutation and publication.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Read one attribute, staged changes taking precedence over the
    /// published manifest.
    pub fn attribute(&self, name: &str) -> Option<String> {
        if let Some(value) = self.staged_attrs.lock().get(name) {
            return Some(value.clone());
        }
        self.manifest.read().attributes.get(name).cloned()
    }

    /// All attributes, merged view of manifest and staged changes.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut merged = self.manifest.read().attributes.clone();
        for (name, value) in self.staged_attrs.lock().iter() {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    /// Open (or fetch from cache) the reader for one segment.
    pub(crate) fn open_reader(&self, info: &SegmentInfo) -> Result<Arc<SegmentReader>> {
        self.cache
            .get(&self.name, self.storage.as_ref(), info, self.config.block_size)
    }

    /// Whether a document is currently present in the index.
    pub fn contains_document(&self, doc_id: DocId) -> Result<bool> {
        self.check_closed()?;

        let views = searcher::snapshot_views(self)?;
        for view in &views {
            if view.is_tombstoned(doc_id) {
                return Ok(false);
            }
            if view.contains_doc(doc_id) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Search the index for documents matching the query terms.
    ///
    /// Every occurrence of a term in `terms` contributes one point to each
    /// document containing that term; results come back sorted by
    /// `(score desc, doc_id asc)` and truncated to `options.limit`.
    pub fn search(&self, terms: &[Term], options: &SearchOptions) -> Result<Vec<SearchResult>> {
        self.check_closed()?;
        searcher::execute(self, terms, options)
    }

    /// Upper bound on the number of distinct documents.
    pub fn doc_count_estimate(&self) -> u64 {
        let manifest = self.manifest.read();
        let segments: u64 = manifest.segments.iter().map(|s| s.doc_count as u64).sum();
        let frozen = self
            .frozen
            .read()
            .as_ref()
            .map(|m| m.doc_count() as u64)
            .unwrap_or(0);
        segments + frozen + self.memory.read().doc_count() as u64
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            doc_count_estimate: self.doc_count_estimate(),
            segment_count: self.manifest.read().segments.len(),
            memory_segment_bytes: self.memory.read().approximate_bytes(),
            revision: self.revision(),
        }
    }

    /// Close the index. Buffered mutations stay recoverable via the oplog.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _flush_guard = self.flush_lock.lock();
        let mut writer = self.writer.lock();
        writer.oplog.close()?;
        self.cache.evict_index(&self.name);
        info!("closed index '{}'", self.name);
        Ok(())
    }
}
