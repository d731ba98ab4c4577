//! LRU cache of open segment readers.
//!
//! Opening a segment loads its skip index and sketches, so readers are
//! shared: the cache hands out `Arc<SegmentReader>` keyed by
//! `(index_name, segment_id)`. Eviction drops the cache's reference; a
//! searcher still holding the `Arc` keeps the reader alive until it
//! finishes, which also makes deferred deletion of merged-away segment
//! files safe.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::index::postings::SegmentId;
use crate::index::segment::SegmentInfo;
use crate::index::segment_reader::SegmentReader;
use crate::storage::Storage;

type CacheKey = (String, SegmentId);

/// Shared LRU cache of open segment readers.
#[derive(Debug)]
pub struct SegmentReaderCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<CacheKey, Arc<SegmentReader>>,
    // Most recently used last.
    order: Vec<CacheKey>,
}

impl SegmentReaderCache {
    /// Create a cache holding at most `capacity` open readers.
    pub fn new(capacity: usize) -> Self {
        SegmentReaderCache {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Get an open reader for a segment, opening it on a miss.
    pub fn get(
        &self,
        index_name: &str,
        storage: &dyn Storage,
        info: &SegmentInfo,
        block_size: usize,
    ) -> Result<Arc<SegmentReader>> {
        let key = (index_name.to_string(), info.id);

        {
            let mut inner = self.inner.lock();
            if let Some(reader) = inner.map.get(&key).cloned() {
                inner.touch(&key);
                return Ok(reader);
            }
        }

        // Open outside the lock so slow I/O doesn't serialize all searches.
        let reader = Arc::new(SegmentReader::open(storage, info, block_size)?);

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.map.get(&key).cloned() {
            // Another thread opened it concurrently; use theirs.
            inner.touch(&key);
            return Ok(existing);
        }
        inner.map.insert(key.clone(), Arc::clone(&reader));
        inner.order.push(key);
        while inner.map.len() > self.capacity {
            let oldest = inner.order.remove(0);
            inner.map.remove(&oldest);
        }

        Ok(reader)
    }

    /// Drop the cached reader for one segment, if present.
    pub fn evict(&self, index_name: &str, segment_id: SegmentId) {
        let key = (index_name.to_string(), segment_id);
        let mut inner = self.inner.lock();
        if inner.map.remove(&key).is_some() {
            inner.order.retain(|k| k != &key);
        }
    }

    /// Drop every cached reader belonging to one index.
    pub fn evict_index(&self, index_name: &str) {
        let mut inner = self.inner.lock();
        inner.map.retain(|(name, _), _| name != index_name);
        inner.order.retain(|(name, _)| name != index_name);
    }

    /// Number of readers currently cached.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos);
            self.order.push(key);
        }
    }
}
