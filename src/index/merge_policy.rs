//! Merge policies for segment maintenance.
//!
//! A policy inspects the manifest's segment list (oldest first) and decides
//! which segments the next merge should consolidate. Selection must be
//! deterministic for a given segment list, and only contiguous runs may be
//! selected: the merged segment replaces its inputs in place, so the
//! relative recency of every other segment is preserved.

use crate::index::postings::SegmentId;
use crate::index::segment::SegmentInfo;

/// Trait for deciding when and what to merge.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Select the segments for the next merge, or `None` when nothing needs
    /// merging. The returned ids form a contiguous run of `segments`.
    fn select_merge(&self, segments: &[SegmentInfo]) -> Option<Vec<SegmentId>>;
}

/// Size-tiered merge policy.
///
/// Segments are bucketed by `floor(log2(block_count))`; a contiguous run of
/// at least `merge_min` segments in one bucket is merged into a single
/// segment. Fresh flushes land in the smallest bucket, so small merges are
/// frequent and large ones rare.
#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    /// Number of same-bucket segments that triggers a merge.
    pub merge_min: usize,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy { merge_min: 4 }
    }
}

impl TieredMergePolicy {
    /// Create a policy with a custom trigger count.
    pub fn new(merge_min: usize) -> Self {
        TieredMergePolicy {
            merge_min: merge_min.max(2),
        }
    }

    fn bucket(block_count: u64) -> u32 {
        63 - block_count.max(1).leading_zeros()
    }
}

impl MergePolicy for TieredMergePolicy {
    fn select_merge(&self, segments: &[SegmentInfo]) -> Option<Vec<SegmentId>> {
        let mut run_start = 0;

        for i in 1..=segments.len() {
            let same_bucket = i < segments.len()
                && Self::bucket(segments[i].block_count)
                    == Self::bucket(segments[run_start].block_count);
            if same_bucket {
                continue;
            }

            if i - run_start >= self.merge_min {
                return Some(segments[run_start..i].iter().map(|s| s.id).collect());
            }
            run_start = i;
        }

        None
    }
}

/// Policy that never merges; useful in tests.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn select_merge(&self, _segments: &[SegmentInfo]) -> Option<Vec<SegmentId>> {
        None
    }
}
