//! Error types for the Swiftlet library.
//!
//! All fallible operations in this crate return [`Result`], whose error type
//! is the [`SwiftletError`] enum. Errors that a front-end needs to
//! distinguish (missing index, corrupt segment, timeout, ...) get their own
//! variants; everything else is folded into a small number of string-carrying
//! variants.

use std::io;

use thiserror::Error;

/// The main error type for Swiftlet operations.
#[derive(Error, Debug)]
pub enum SwiftletError {
    /// I/O errors (file operations, sync failures, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors (manifest files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A named thing (index, document, file) does not exist.
    #[error("{what} not found: {name}")]
    NotFound {
        /// What kind of thing was looked up ("index", "document", "file").
        what: &'static str,
        /// The name or id that was looked up.
        name: String,
    },

    /// A named thing already exists and may not be created again.
    #[error("{what} already exists: {name}")]
    AlreadyExists {
        /// What kind of thing was created ("index", "file").
        what: &'static str,
        /// The conflicting name.
        name: String,
    },

    /// The caller passed something invalid (bad index name, zero block size).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A segment file failed its checksum or structural validation.
    #[error("corrupt segment {segment_id} at offset {offset}")]
    CorruptSegment {
        /// Id of the segment whose file failed validation.
        segment_id: u32,
        /// Byte offset of the failing block or footer within the file.
        offset: u64,
    },

    /// The index as a whole cannot be opened (no valid manifest, bad oplog).
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// Storage-related errors not covered by a more specific variant.
    #[error("storage error: {0}")]
    Storage(String),

    /// A search deadline expired before scoring completed.
    #[error("operation timed out")]
    Timeout,

    /// The index or storage has been closed.
    #[error("already closed")]
    Closed,
}

/// Result type alias for operations that may fail with [`SwiftletError`].
pub type Result<T> = std::result::Result<T, SwiftletError>;

impl SwiftletError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        SwiftletError::Storage(msg.into())
    }

    /// Create a new not-found error.
    pub fn not_found<S: Into<String>>(what: &'static str, name: S) -> Self {
        SwiftletError::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Create a new already-exists error.
    pub fn already_exists<S: Into<String>>(what: &'static str, name: S) -> Self {
        SwiftletError::AlreadyExists {
            what,
            name: name.into(),
        }
    }

    /// Create a new invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        SwiftletError::InvalidArgument(msg.into())
    }

    /// Create a new corrupt-segment error.
    pub fn corrupt_segment(segment_id: u32, offset: u64) -> Self {
        SwiftletError::CorruptSegment { segment_id, offset }
    }

    /// Create a new corrupt-index error.
    pub fn corrupt_index<S: Into<String>>(msg: S) -> Self {
        SwiftletError::CorruptIndex(msg.into())
    }
}
