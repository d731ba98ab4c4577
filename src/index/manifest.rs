//! Manifest: the authoritative record of an index's live segments.
//!
//! Each revision is stored as its own JSON file `manifest.<revision>`,
//! written to a temporary name first and renamed into place; the rename plus
//! a directory sync make the swap atomic and durable. On open the highest
//! parseable revision wins, falling back to the next-lower file if the
//! newest one is damaged.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwiftletError};
use crate::index::segment::SegmentInfo;
use crate::storage::{Storage, StorageOutput};

const MANIFEST_PREFIX: &str = "manifest.";
const MANIFEST_TMP_PREFIX: &str = "manifest.tmp.";

/// Snapshot of the index's on-disk state at one revision.
///
/// `segments` is ordered oldest to newest; for conflict resolution a later
/// entry always wins over an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Revision number; strictly increases with every publication.
    pub revision: u64,

    /// Live segments, oldest first.
    pub segments: Vec<SegmentInfo>,

    /// Index attributes, last published values.
    pub attributes: BTreeMap<String, String>,

    /// Oplog sequence number covered by the segments; replay starts after it.
    pub checkpoint_seq: u64,
}

impl Manifest {
    /// File name for a given revision.
    pub fn file_name(revision: u64) -> String {
        format!("{MANIFEST_PREFIX}{revision}")
    }

    /// Clone the shared handle out of a manifest lock, releasing the guard
    /// immediately.
    pub(crate) fn clone_handle(lock: &RwLock<Arc<Manifest>>) -> Arc<Manifest> {
        lock.read().clone()
    }

    /// Parse `manifest.<revision>` file names; rejects temporary files.
    fn parse_revision(name: &str) -> Option<u64> {
        let rest = name.strip_prefix(MANIFEST_PREFIX)?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    }

    /// Persist this manifest durably: temp file, fsync, rename, dir sync.
    pub fn write(&self, storage: &dyn Storage) -> Result<()> {
        let tmp_name = format!("{MANIFEST_TMP_PREFIX}{}", self.revision);
        let mut output = storage.create_output(&tmp_name)?;
        let encoded = serde_json::to_vec(self)?;
        output.write_all(&encoded)?;
        output.close()?;

        storage.rename_file(&tmp_name, &Self::file_name(self.revision))?;
        storage.sync()?;
        Ok(())
    }

    fn read(storage: &dyn Storage, revision: u64) -> Result<Manifest> {
        let mut input = storage.open_input(&Self::file_name(revision))?;
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;

        let manifest: Manifest = serde_json::from_slice(&raw)?;
        if manifest.revision != revision {
            return Err(SwiftletError::corrupt_index(format!(
                "manifest.{revision} claims revision {}",
                manifest.revision
            )));
        }
        // A published manifest only ever references fully written segments.
        for segment in &manifest.segments {
            if !storage.file_exists(&segment.data_file_name())
                || !storage.file_exists(&segment.index_file_name())
            {
                return Err(SwiftletError::corrupt_index(format!(
                    "manifest.{revision} references missing segment {}",
                    segment.id
                )));
            }
        }
        Ok(manifest)
    }

    /// Load the newest valid manifest, or `None` if the directory holds no
    /// manifest at all. Falls back past damaged revisions; fails with
    /// `CorruptIndex` when manifests exist but none is valid.
    pub fn load_latest(storage: &dyn Storage) -> Result<Option<Manifest>> {
        let mut revisions: Vec<u64> = storage
            .list_files()?
            .iter()
            .filter_map(|name| Self::parse_revision(name))
            .collect();
        revisions.sort_unstable_by(|a, b| b.cmp(a));

        if revisions.is_empty() {
            return Ok(None);
        }

        for &revision in &revisions {
            match Self::read(storage, revision) {
                Ok(manifest) => return Ok(Some(manifest)),
                Err(e) => {
                    warn!("manifest.{revision} unusable, falling back: {e}");
                }
            }
        }

        Err(SwiftletError::corrupt_index(
            "no valid manifest revision found",
        ))
    }

    /// Delete stale files: older manifest revisions, leftover temp files and
    /// segment files this manifest does not reference. Only safe when no
    /// flush or merge is in flight; errors are ignored, stale files are
    /// retried on the next pass.
    pub fn gc_stale_files(&self, storage: &dyn Storage) {
        let Ok(files) = storage.list_files() else {
            return;
        };

        let mut removed = 0usize;
        for name in files {
            let stale = if let Some(revision) = Self::parse_revision(&name) {
                revision != self.revision
            } else if name.starts_with(MANIFEST_TMP_PREFIX) || name.ends_with(".tmp") {
                true
            } else if name.starts_with("segment_") {
                !self
                    .segments
                    .iter()
                    .any(|s| s.data_file_name() == name || s.index_file_name() == name)
            } else {
                false
            };

            if stale && storage.delete_file(&name).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("garbage-collected {removed} stale files at revision {}", self.revision);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn segment(id: u32) -> SegmentInfo {
        SegmentInfo {
            id,
            block_count: 1,
            last_key: 10,
            checksum: 0,
            doc_count: 1,
        }
    }

    fn touch(storage: &dyn Storage, name: &str) {
        let mut out = storage.create_output(name).unwrap();
        out.write_all(b"x").unwrap();
        out.close().unwrap();
    }

    #[test]
    fn test_parse_revision() {
        assert_eq!(Manifest::parse_revision("manifest.0"), Some(0));
        assert_eq!(Manifest::parse_revision("manifest.42"), Some(42));
        assert_eq!(Manifest::parse_revision("manifest.tmp.42"), None);
        assert_eq!(Manifest::parse_revision("manifest."), None);
        assert_eq!(Manifest::parse_revision("segment_1.fid"), None);
    }

    #[test]
    fn test_write_and_load_roundtrip() {
        let storage = MemoryStorage::new();
        touch(&storage, "segment_1.fid");
        touch(&storage, "segment_1.fii");

        let mut manifest = Manifest {
            revision: 3,
            segments: vec![segment(1)],
            checkpoint_seq: 17,
            ..Default::default()
        };
        manifest
            .attributes
            .insert("foo".to_string(), "bar".to_string());
        manifest.write(&storage).unwrap();

        assert!(storage.file_exists("manifest.3"));
        assert!(!storage.file_exists("manifest.tmp.3"));

        let loaded = Manifest::load_latest(&storage).unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_load_latest_picks_highest() {
        let storage = MemoryStorage::new();

        for revision in [1, 5, 3] {
            let manifest = Manifest {
                revision,
                ..Default::default()
            };
            manifest.write(&storage).unwrap();
        }

        let loaded = Manifest::load_latest(&storage).unwrap().unwrap();
        assert_eq!(loaded.revision, 5);
    }

    #[test]
    fn test_load_latest_empty_directory() {
        let storage = MemoryStorage::new();
        assert!(Manifest::load_latest(&storage).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_manifest_falls_back() {
        let storage = MemoryStorage::new();

        let manifest = Manifest {
            revision: 1,
            ..Default::default()
        };
        manifest.write(&storage).unwrap();

        // A damaged newer revision falls back to revision 1.
        touch(&storage, "manifest.2");
        let loaded = Manifest::load_latest(&storage).unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
    }

    #[test]
    fn test_all_manifests_corrupt() {
        let storage = MemoryStorage::new();
        touch(&storage, "manifest.1");
        touch(&storage, "manifest.2");

        match Manifest::load_latest(&storage) {
            Err(SwiftletError::CorruptIndex(_)) => {}
            other => panic!("expected CorruptIndex, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_segment_invalidates_manifest() {
        let storage = MemoryStorage::new();

        let good = Manifest {
            revision: 1,
            ..Default::default()
        };
        good.write(&storage).unwrap();

        // Revision 2 references a segment whose files never made it.
        let bad = Manifest {
            revision: 2,
            segments: vec![segment(9)],
            ..Default::default()
        };
        bad.write(&storage).unwrap();

        let loaded = Manifest::load_latest(&storage).unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
    }

    #[test]
    fn test_gc_stale_files() {
        let storage = MemoryStorage::new();
        touch(&storage, "segment_1.fid");
        touch(&storage, "segment_1.fii");
        touch(&storage, "segment_7.fid");
        touch(&storage, "segment_7.fii");
        touch(&storage, "manifest.tmp.9");
        touch(&storage, "seg_0.tmp");
        touch(&storage, "oplog.log");

        let old = Manifest {
            revision: 1,
            ..Default::default()
        };
        old.write(&storage).unwrap();

        let active = Manifest {
            revision: 2,
            segments: vec![segment(1)],
            ..Default::default()
        };
        active.write(&storage).unwrap();

        active.gc_stale_files(&storage);

        let files = storage.list_files().unwrap();
        assert_eq!(
            files,
            vec!["manifest.2", "oplog.log", "segment_1.fid", "segment_1.fii"]
        );
    }
}
