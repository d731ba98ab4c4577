use std::collections::BTreeMap;
use std::sync::Arc;

use swiftlet::config::{IndexConfig, SearchOptions};
use swiftlet::error::Result;
use swiftlet::index::Index;
use swiftlet::search::SearchResult;
use swiftlet::storage::{MemoryStorage, Storage};

fn small_segment_index(merge_min: usize) -> Result<Index> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexConfig {
        merge_min,
        ..Default::default()
    };
    Index::create("main", storage, config)
}

#[test]
fn test_last_write_wins_across_maintenance() -> Result<()> {
    let index = small_segment_index(2)?;

    // Version A in one segment, version B in a later one.
    index.upsert(7, &[1, 2, 3])?;
    index.flush()?;
    index.upsert(7, &[3, 4])?;
    index.flush()?;
    index.optimize()?;

    // Terms only in A never answer; terms in B do.
    assert!(index.search(&[1, 2], &SearchOptions::default())?.is_empty());
    let results = index.search(&[3, 4], &SearchOptions::default())?;
    assert_eq!(results, vec![SearchResult::new(7, 2)]);
    Ok(())
}

#[test]
fn test_delete_holds_through_flush_and_merge() -> Result<()> {
    let index = small_segment_index(2)?;

    index.upsert(7, &[1, 2, 3])?;
    index.upsert(8, &[1])?;
    index.flush()?;
    index.delete(7)?;
    index.flush()?;
    index.optimize()?;

    let results = index.search(&[1, 2, 3], &SearchOptions::default())?;
    assert_eq!(results, vec![SearchResult::new(8, 1)]);
    assert!(!index.contains_document(7)?);
    Ok(())
}

#[test]
fn test_tombstone_masks_segment_outside_merge() -> Result<()> {
    let index = small_segment_index(2)?;

    // A large oldest segment holding doc 7 among many others.
    for doc_id in 100..400u32 {
        index.upsert(doc_id, &[doc_id * 3, doc_id * 3 + 1])?;
    }
    index.upsert(7, &[1, 2])?;
    index.flush()?;

    // Two small segments follow; the second carries the tombstone for 7.
    // The tiered policy merges only the small pair and leaves the large
    // segment untouched.
    index.upsert(8, &[1])?;
    index.flush()?;
    index.delete(7)?;
    index.flush()?;
    assert_eq!(index.stats().segment_count, 2);

    // The tombstone survived the merge and still masks the old segment.
    let results = index.search(&[1, 2], &SearchOptions::default())?;
    assert_eq!(results, vec![SearchResult::new(8, 1)]);
    assert!(!index.contains_document(7)?);
    Ok(())
}

#[test]
fn test_reinsert_after_delete() -> Result<()> {
    let index = small_segment_index(2)?;

    index.upsert(7, &[1, 2])?;
    index.flush()?;
    index.delete(7)?;
    index.flush()?;
    index.upsert(7, &[9])?;
    index.flush()?;
    index.optimize()?;

    assert!(index.search(&[1, 2], &SearchOptions::default())?.is_empty());
    let results = index.search(&[9], &SearchOptions::default())?;
    assert_eq!(results, vec![SearchResult::new(7, 1)]);
    Ok(())
}

/// Tiny deterministic PRNG so the model test reproduces exactly.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Reference model: the current term set per live document.
fn expected_results(model: &BTreeMap<u32, Vec<u32>>, query: &[u32]) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = model
        .iter()
        .filter_map(|(&doc_id, terms)| {
            let score = query.iter().filter(|&&t| terms.contains(&t)).count() as u32;
            (score >= 1).then_some(SearchResult::new(doc_id, score))
        })
        .collect();
    results.sort_by(|a, b| b.score.cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
    results
}

#[test]
fn test_randomized_operations_match_model() -> Result<()> {
    let index = small_segment_index(2)?;
    let mut rng = XorShift(0x5EED_CAFE_F00D_0001);
    let mut model: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

    for step in 0..400u32 {
        let doc_id = rng.below(40) as u32;
        match rng.below(10) {
            0..=5 => {
                let mut terms: Vec<u32> = (0..1 + rng.below(6)).map(|_| rng.below(30) as u32).collect();
                index.upsert(doc_id, &terms)?;
                terms.sort_unstable();
                terms.dedup();
                model.insert(doc_id, terms);
            }
            6..=7 => {
                index.delete(doc_id)?;
                model.remove(&doc_id);
            }
            8 => {
                index.flush()?;
            }
            _ => {
                index.optimize()?;
            }
        }

        // Check a couple of random queries at every tenth step.
        if step % 10 == 9 {
            for _ in 0..3 {
                let query: Vec<u32> =
                    (0..1 + rng.below(4)).map(|_| rng.below(30) as u32).collect();
                let mut expected = expected_results(&model, &query);
                expected.truncate(500);

                let actual = index.search(&query, &SearchOptions::default())?;
                assert_eq!(actual, expected, "step {step}, query {query:?}");
            }
        }
    }

    Ok(())
}

#[test]
fn test_doc_count_estimate_shrinks_after_optimize() -> Result<()> {
    let index = small_segment_index(100)?; // no automatic merges

    for round in 0..4u32 {
        index.upsert(1, &[round + 1])?;
        index.flush()?;
    }
    // Doc 1 appears in four segments, so the estimate overcounts.
    assert!(index.stats().doc_count_estimate >= 4);

    index.optimize()?;
    assert_eq!(index.stats().doc_count_estimate, 1);
    Ok(())
}
