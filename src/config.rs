//! Configuration types for indexes and searches.

use std::time::Instant;

/// Configuration for a single index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Fixed byte size of an on-disk posting block.
    pub block_size: usize,

    /// Approximate in-memory segment footprint that triggers a flush.
    pub flush_threshold_bytes: usize,

    /// Number of same-sized segments that triggers a merge.
    pub merge_min: usize,

    /// Whether background merging is evaluated after flushes.
    pub merge_enabled: bool,

    /// Maximum number of open segment readers kept in the shared cache.
    pub max_open_segments: usize,

    /// Whether every oplog append is fsynced before being acknowledged.
    pub sync_oplog: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            block_size: 1024,
            flush_threshold_bytes: 4 * 1024 * 1024, // 4MB
            merge_min: 4,
            merge_enabled: true,
            max_open_segments: 64,
            sync_oplog: true,
        }
    }
}

impl IndexConfig {
    /// Validate configuration values that the on-disk format depends on.
    pub fn validate(&self) -> crate::error::Result<()> {
        // A block must fit its header, one worst-case posting and the
        // trailing checksum.
        if self.block_size < 32 {
            return Err(crate::error::SwiftletError::invalid_argument(format!(
                "block_size must be at least 32 bytes, got {}",
                self.block_size
            )));
        }
        if self.merge_min < 2 {
            return Err(crate::error::SwiftletError::invalid_argument(format!(
                "merge_min must be at least 2, got {}",
                self.merge_min
            )));
        }
        if self.max_open_segments == 0 {
            return Err(crate::error::SwiftletError::invalid_argument(
                "max_open_segments must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Options for a single search request.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum number of results to return.
    pub limit: usize,

    /// Minimum score (inclusive) a document must reach to be returned.
    pub min_score: u32,

    /// Optional deadline; scoring past this instant fails with `Timeout`.
    pub deadline: Option<Instant>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: 500,
            min_score: 1,
            deadline: None,
        }
    }
}

impl SearchOptions {
    /// Set the result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the minimum score.
    pub fn with_min_score(mut self, min_score: u32) -> Self {
        self.min_score = min_score;
        self
    }

    /// Set the search deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_config_default() {
        let config = IndexConfig::default();

        assert_eq!(config.block_size, 1024);
        assert_eq!(config.merge_min, 4);
        assert!(config.merge_enabled);
        assert!(config.sync_oplog);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_index_config_validation() {
        let config = IndexConfig {
            block_size: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IndexConfig {
            merge_min: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_search_options_default() {
        let options = SearchOptions::default();

        assert_eq!(options.limit, 500);
        assert_eq!(options.min_score, 1);
        assert!(options.deadline.is_none());
    }
}
