//! # Swiftlet
//!
//! A segmented log-structured search index for acoustic fingerprints.
//!
//! Documents are small multisets of 32-bit hash terms; queries are lists of
//! terms and return the documents ranked by how many query terms they
//! contain. The engine keeps a sorted in-memory write buffer in front of a
//! set of immutable on-disk segments, with a durable oplog for crash
//! recovery and a manifest that atomically publishes every segment-set
//! change.
//!
//! ## Features
//!
//! - Pure Rust implementation
//! - Compressed fixed-size posting blocks with skip-index random access
//! - Per-document last-write-wins across segments
//! - Size-tiered background merging
//! - Durable oplog + atomically swapped manifest
//! - Pluggable storage backends (filesystem and in-memory)
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use swiftlet::config::{IndexConfig, SearchOptions};
//! use swiftlet::index::Index;
//! use swiftlet::storage::MemoryStorage;
//!
//! # fn main() -> swiftlet::error::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let index = Index::create("main", storage, IndexConfig::default())?;
//!
//! index.upsert(111, &[1, 2, 3])?;
//! index.upsert(112, &[3, 4, 5])?;
//!
//! let results = index.search(&[1, 2, 3], &SearchOptions::default())?;
//! assert_eq!(results[0].doc_id, 111);
//! assert_eq!(results[0].score, 3);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod multi_index;
pub mod search;
pub mod storage;
pub mod util;

pub use config::{IndexConfig, SearchOptions};
pub use error::{Result, SwiftletError};
pub use index::{Index, IndexStats, Op};
pub use multi_index::MultiIndex;
pub use search::SearchResult;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
