//! Registry of named indexes sharing one storage backend.
//!
//! Each index lives in its own `<name>/` namespace of the shared storage.
//! Index handles are created lazily and shared, and all open segment readers
//! go through one cache so the open-file cap is global.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use crate::config::IndexConfig;
use crate::error::{Result, SwiftletError};
use crate::index::index::Index;
use crate::index::merge_policy::TieredMergePolicy;
use crate::index::segment_cache::SegmentReaderCache;
use crate::storage::{FileStorage, Storage, StorageConfig, StorageInput, StorageOutput};

/// Check an index name against the allowed alphabet `[A-Za-z0-9_-]+`.
pub fn validate_index_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SwiftletError::invalid_argument("index name is empty"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(SwiftletError::invalid_argument(format!(
            "invalid index name: {name:?}"
        )));
    }
    Ok(())
}

/// A collection of independent indexes sharing one storage backend.
pub struct MultiIndex {
    storage: Arc<dyn Storage>,
    config: IndexConfig,
    cache: Arc<SegmentReaderCache>,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MultiIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiIndex")
            .field("open_indexes", &self.indexes.read().len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl MultiIndex {
    /// Create a registry over an arbitrary storage backend.
    pub fn new(storage: Arc<dyn Storage>, config: IndexConfig) -> Result<MultiIndex> {
        config.validate()?;
        let cache = Arc::new(SegmentReaderCache::new(config.max_open_segments));

        Ok(MultiIndex {
            storage,
            config,
            cache,
            indexes: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a registry rooted at a filesystem directory.
    pub fn open_directory<P: AsRef<Path>>(path: P, config: IndexConfig) -> Result<MultiIndex> {
        let storage = Arc::new(FileStorage::new(path, StorageConfig::default())?);
        Self::new(storage, config)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(SwiftletError::Closed)
        } else {
            Ok(())
        }
    }

    fn index_storage(&self, name: &str) -> Arc<dyn Storage> {
        Arc::new(IndexStorage {
            namespace: format!("{name}/"),
            backend: Arc::clone(&self.storage),
        })
    }

    fn open_index(&self, name: &str, create: bool) -> Result<Arc<Index>> {
        if let Some(index) = self.indexes.read().get(name) {
            return Ok(Arc::clone(index));
        }

        let mut indexes = self.indexes.write();
        // Double-checked: another thread may have opened it meanwhile.
        if let Some(index) = indexes.get(name) {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(Index::open_internal(
            name.to_string(),
            self.index_storage(name),
            self.config.clone(),
            Arc::clone(&self.cache),
            Box::new(TieredMergePolicy::new(self.config.merge_min)),
            create,
        )?);
        indexes.insert(name.to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Open an index, creating it if absent. Idempotent.
    pub fn create_index(&self, name: &str) -> Result<Arc<Index>> {
        self.check_closed()?;
        validate_index_name(name)?;
        self.open_index(name, true)
    }

    /// Get an existing index; `NotFound` if it was never created.
    pub fn get_index(&self, name: &str) -> Result<Arc<Index>> {
        self.check_closed()?;
        validate_index_name(name)?;
        self.open_index(name, false)
    }

    /// Delete an index: close its readers and remove all its files.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.check_closed()?;
        validate_index_name(name)?;

        let existing = self.indexes.write().remove(name);
        if let Some(index) = &existing {
            index.close()?;
        }
        self.cache.evict_index(name);

        let prefix = format!("{name}/");
        let files: Vec<String> = self
            .storage
            .list_files()?
            .into_iter()
            .filter(|f| f.starts_with(&prefix))
            .collect();
        if existing.is_none() && files.is_empty() {
            return Err(SwiftletError::not_found("index", name));
        }
        for file in files {
            self.storage.delete_file(&file)?;
        }

        info!("deleted index '{name}'");
        Ok(())
    }

    /// Names of all indexes present in storage, sorted.
    pub fn list_indexes(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut names: Vec<String> = self
            .storage
            .list_files()?
            .into_iter()
            .filter_map(|file| {
                let (name, rest) = file.split_once('/')?;
                rest.starts_with("manifest.").then(|| name.to_string())
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Close every open index and sync the backend.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let indexes = std::mem::take(&mut *self.indexes.write());
        for index in indexes.values() {
            index.close()?;
        }
        self.storage.sync()?;
        Ok(())
    }
}

/// Storage view confined to one index's subdirectory of the shared backend.
///
/// Index code addresses its files by bare name (`manifest.3`, `oplog.log`,
/// `segment_7.fid`); this view maps them under `<index>/` on the way down
/// and back out of the namespace when listing. It never outlives the
/// registry, so a name has already passed [`validate_index_name`] and can
/// never contain a separator of its own.
#[derive(Debug)]
struct IndexStorage {
    /// `<index>/`, with the trailing separator baked in.
    namespace: String,
    backend: Arc<dyn Storage>,
}

impl IndexStorage {
    fn scoped(&self, file: &str) -> String {
        let mut scoped = String::with_capacity(self.namespace.len() + file.len());
        scoped.push_str(&self.namespace);
        scoped.push_str(file);
        scoped
    }
}

impl Storage for IndexStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.backend.open_input(&self.scoped(name))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.backend.create_output(&self.scoped(name))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.backend.create_output_append(&self.scoped(name))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.backend.file_exists(&self.scoped(name))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.backend.delete_file(&self.scoped(name))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        // The backend lists sorted names; stripping a common prefix keeps
        // them sorted, so no re-sort is needed.
        let files = self.backend.list_files()?;
        Ok(files
            .iter()
            .filter_map(|entry| entry.strip_prefix(&self.namespace))
            .map(str::to_string)
            .collect())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.backend.file_size(&self.scoped(name))
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.backend
            .rename_file(&self.scoped(old_name), &self.scoped(new_name))
    }

    fn create_temp_output(&self, prefix: &str) -> Result<(String, Box<dyn StorageOutput>)> {
        let (scoped_name, output) = self.backend.create_temp_output(&self.scoped(prefix))?;
        let name = scoped_name
            .strip_prefix(&self.namespace)
            .unwrap_or(&scoped_name)
            .to_string();
        Ok((name, output))
    }

    fn sync(&self) -> Result<()> {
        self.backend.sync()
    }

    fn close(&mut self) -> Result<()> {
        // The registry owns the backend; a per-index view closes nothing.
        Ok(())
    }
}
