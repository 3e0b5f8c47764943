//! Integration tests for the index layer

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::TempDir;

use crate::buffer::BufMgr;
use crate::index::{BTreeIndex, Datatype, IndexError, Key, Operator};
use crate::relation::{RecordId, TableFile};

/// Byte offset of the key attribute within the test records.
const ATTR_OFFSET: usize = 4;

/// Record length used by the test relations.
const RECORD_LEN: usize = 16;

fn setup(pool_size: usize) -> (TempDir, BufMgr) {
    (tempfile::tempdir().unwrap(), BufMgr::new(pool_size))
}

/// Create a relation holding one record per key, in the given order.
/// Returns the rid each key was stored under.
fn build_relation(pool: &BufMgr, path: &str, keys: &[Key]) -> HashMap<Key, Vec<RecordId>> {
    let mut table = TableFile::create(pool, path, RECORD_LEN).unwrap();
    let mut rids: HashMap<Key, Vec<RecordId>> = HashMap::new();

    for &key in keys {
        let mut record = [0u8; RECORD_LEN];
        record[ATTR_OFFSET..ATTR_OFFSET + 4].copy_from_slice(&key.to_le_bytes());
        let rid = table.insert_record(&record).unwrap();
        rids.entry(key).or_default().push(rid);
    }

    table.flush().unwrap();
    rids
}

fn shuffled(range: std::ops::Range<Key>, seed: u64) -> Vec<Key> {
    let mut keys: Vec<Key> = range.collect();
    let mut rng = StdRng::seed_from_u64(seed);
    keys.shuffle(&mut rng);
    keys
}

/// Run a scan to completion, returning the rids in scan order.
fn collect_scan(
    index: &mut BTreeIndex<'_>,
    low: Key,
    low_op: Operator,
    high: Key,
    high_op: Operator,
) -> Result<Vec<RecordId>, IndexError> {
    index.start_scan(low, low_op, high, high_op)?;
    let mut rids = Vec::new();
    loop {
        match index.scan_next() {
            Ok(rid) => rids.push(rid),
            Err(IndexError::IndexScanCompleted) => break,
            Err(e) => return Err(e),
        }
    }
    index.end_scan()?;
    Ok(rids)
}

#[test]
fn point_scan_after_random_build() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    let rids = build_relation(&pool, &relation, &shuffled(0..5000, 7));

    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();

    index
        .start_scan(2500, Operator::Gte, 2500, Operator::Lte)
        .unwrap();
    assert_eq!(index.scan_next().unwrap(), rids[&2500][0]);
    assert!(matches!(
        index.scan_next(),
        Err(IndexError::IndexScanCompleted)
    ));
    index.end_scan().unwrap();

    assert_eq!(pool.pinned_frame_count(), 0);
}

#[test]
fn range_scan_yields_keys_in_order() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    let rids = build_relation(&pool, &relation, &shuffled(0..5000, 11));

    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();

    let result = collect_scan(&mut index, 10, Operator::Gt, 20, Operator::Lte).unwrap();
    let expected: Vec<RecordId> = (11..=20).map(|k| rids[&k][0]).collect();
    assert_eq!(result, expected);

    assert_eq!(pool.pinned_frame_count(), 0);
}

#[test]
fn range_scan_crosses_leaf_boundaries() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    let rids = build_relation(&pool, &relation, &shuffled(0..500, 13));

    // Tiny fanout: the 11-key range below spans several leaves.
    let mut index =
        BTreeIndex::with_fanout(&pool, &relation, ATTR_OFFSET, Datatype::Integer, 4, 4).unwrap();
    assert!(index.height().unwrap() >= 2);

    let result = collect_scan(&mut index, 10, Operator::Gt, 20, Operator::Lte).unwrap();
    let expected: Vec<RecordId> = (11..=20).map(|k| rids[&k][0]).collect();
    assert_eq!(result, expected);
}

#[test]
fn empty_range_reports_no_such_key() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    build_relation(&pool, &relation, &shuffled(0..100, 17));

    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();

    let result = index.start_scan(500, Operator::Gte, 600, Operator::Lte);
    assert!(matches!(result, Err(IndexError::NoSuchKeyFound)));

    // The failed start left no scan behind.
    assert!(matches!(
        index.scan_next(),
        Err(IndexError::ScanNotInitialized)
    ));
    assert_eq!(pool.pinned_frame_count(), 0);
}

#[test]
fn empty_relation_scans_find_nothing() {
    let (dir, pool) = setup(16);
    let relation = dir.path().join("rel").display().to_string();
    build_relation(&pool, &relation, &[]);

    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();
    let result = index.start_scan(0, Operator::Gte, i32::MAX, Operator::Lte);
    assert!(matches!(result, Err(IndexError::NoSuchKeyFound)));
}

#[test]
fn scan_parameter_validation() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    build_relation(&pool, &relation, &shuffled(0..50, 19));

    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();

    assert!(matches!(
        index.start_scan(10, Operator::Lt, 20, Operator::Lte),
        Err(IndexError::BadOpcodes)
    ));
    assert!(matches!(
        index.start_scan(10, Operator::Gte, 20, Operator::Gt),
        Err(IndexError::BadOpcodes)
    ));
    assert!(matches!(
        index.start_scan(30, Operator::Gte, 10, Operator::Lte),
        Err(IndexError::BadScanrange)
    ));
}

#[test]
fn scan_calls_require_an_active_scan() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    build_relation(&pool, &relation, &shuffled(0..50, 23));

    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();

    assert!(matches!(
        index.scan_next(),
        Err(IndexError::ScanNotInitialized)
    ));
    assert!(matches!(
        index.end_scan(),
        Err(IndexError::ScanNotInitialized)
    ));

    index.start_scan(0, Operator::Gte, 10, Operator::Lte).unwrap();
    index.end_scan().unwrap();
    assert!(matches!(
        index.end_scan(),
        Err(IndexError::ScanNotInitialized)
    ));
}

#[test]
fn starting_a_scan_ends_the_previous_one() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    let rids = build_relation(&pool, &relation, &shuffled(0..100, 29));

    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();

    index.start_scan(0, Operator::Gte, 99, Operator::Lte).unwrap();
    index.scan_next().unwrap();
    assert_eq!(pool.pinned_frame_count(), 1);

    // Restart without an explicit end_scan.
    index
        .start_scan(50, Operator::Gte, 50, Operator::Lte)
        .unwrap();
    assert_eq!(pool.pinned_frame_count(), 1);
    assert_eq!(index.scan_next().unwrap(), rids[&50][0]);

    index.end_scan().unwrap();
    assert_eq!(pool.pinned_frame_count(), 0);
}

#[test]
fn duplicate_keys_scan_in_insertion_order() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    let rids = build_relation(&pool, &relation, &[5, 7, 7, 3, 7]);

    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();

    let result = collect_scan(&mut index, 7, Operator::Gte, 7, Operator::Lte).unwrap();
    assert_eq!(result, rids[&7]);
}

#[test]
fn point_scans_find_every_key_at_small_fanout() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    let rids = build_relation(&pool, &relation, &(0..200).collect::<Vec<_>>());

    let mut index =
        BTreeIndex::with_fanout(&pool, &relation, ATTR_OFFSET, Datatype::Integer, 4, 4).unwrap();

    // Every key is reachable, including those promoted into separators.
    for key in 0..200 {
        let result = collect_scan(&mut index, key, Operator::Gte, key, Operator::Lte).unwrap();
        assert_eq!(result, rids[&key], "key {}", key);
    }
    assert_eq!(pool.pinned_frame_count(), 0);
}

#[test]
fn deep_tree_full_scan_is_sorted() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    let rids = build_relation(&pool, &relation, &shuffled(0..500, 31));

    let mut index =
        BTreeIndex::with_fanout(&pool, &relation, ATTR_OFFSET, Datatype::Integer, 4, 4).unwrap();
    assert!(index.height().unwrap() >= 3);

    let result = collect_scan(&mut index, 0, Operator::Gte, 499, Operator::Lte).unwrap();
    let expected: Vec<RecordId> = (0..500).map(|k| rids[&k][0]).collect();
    assert_eq!(result, expected);
}

#[test]
fn reopen_uses_the_existing_index() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    let rids = build_relation(&pool, &relation, &shuffled(0..300, 37));

    let index_name = {
        let index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();
        index.index_name().to_string()
    };

    let file = pool.open_file(&index_name).unwrap();
    let pages_before = pool.file_page_count(file).unwrap();

    // Opening again must adopt the persisted tree, not rebuild it.
    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();
    assert_eq!(pool.file_page_count(file).unwrap(), pages_before);

    let result = collect_scan(&mut index, 0, Operator::Gte, 299, Operator::Lte).unwrap();
    let expected: Vec<RecordId> = (0..300).map(|k| rids[&k][0]).collect();
    assert_eq!(result, expected);
}

#[test]
fn index_survives_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let relation = dir.path().join("rel").display().to_string();
    let keys = shuffled(0..300, 41);

    let rids = {
        let pool = BufMgr::new(64);
        let rids = build_relation(&pool, &relation, &keys);
        let index =
            BTreeIndex::with_fanout(&pool, &relation, ATTR_OFFSET, Datatype::Integer, 8, 8)
                .unwrap();
        drop(index);
        rids
        // Pool dropped here; the index destructor already flushed.
    };

    let pool = BufMgr::new(64);
    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();

    let result = collect_scan(&mut index, 0, Operator::Gte, i32::MAX, Operator::Lte).unwrap();
    let expected: Vec<RecordId> = (0..300).map(|k| rids[&k][0]).collect();
    assert_eq!(result, expected);
}

#[test]
fn persistence_preserves_duplicate_multiset() {
    let dir = tempfile::tempdir().unwrap();
    let relation = dir.path().join("rel").display().to_string();
    let mut keys: Vec<Key> = (0..100).chain(0..100).collect();
    let mut rng = StdRng::seed_from_u64(43);
    keys.shuffle(&mut rng);

    let rids = {
        let pool = BufMgr::new(64);
        let rids = build_relation(&pool, &relation, &keys);
        let index =
            BTreeIndex::with_fanout(&pool, &relation, ATTR_OFFSET, Datatype::Integer, 8, 8)
                .unwrap();
        drop(index);
        rids
    };
    let key_of: HashMap<RecordId, Key> = rids
        .iter()
        .flat_map(|(&k, rids)| rids.iter().map(move |&rid| (rid, k)))
        .collect();

    let pool = BufMgr::new(64);
    let mut index = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Integer).unwrap();
    let result = collect_scan(&mut index, 0, Operator::Gte, 99, Operator::Lte).unwrap();

    // Both copies of every key come back, in non-decreasing key order.
    assert_eq!(result.len(), 200);
    let scanned: Vec<Key> = result.iter().map(|rid| key_of[rid]).collect();
    let mut expected: Vec<Key> = keys.clone();
    expected.sort_unstable();
    assert_eq!(scanned, expected);
}

#[test]
fn non_integer_attributes_are_rejected() {
    let (dir, pool) = setup(16);
    let relation = dir.path().join("rel").display().to_string();
    build_relation(&pool, &relation, &[1, 2, 3]);

    let result = BTreeIndex::new(&pool, &relation, ATTR_OFFSET, Datatype::Double);
    assert!(matches!(result, Err(IndexError::BadIndexInfo(_))));
}

#[test]
fn build_leaves_no_pages_pinned() {
    let (dir, pool) = setup(64);
    let relation = dir.path().join("rel").display().to_string();
    build_relation(&pool, &relation, &shuffled(0..1000, 47));

    let index =
        BTreeIndex::with_fanout(&pool, &relation, ATTR_OFFSET, Datatype::Integer, 8, 8).unwrap();
    assert_eq!(pool.pinned_frame_count(), 0);
    drop(index);
    assert_eq!(pool.pinned_frame_count(), 0);
}
