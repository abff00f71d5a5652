//! End-to-end scenarios for the storage engine.
//!
//! Exercises the full data path: paged files cached by the buffer pool,
//! slotted-page record files, and the three index construction
//! strategies over the same inputs.

use bytes::Bytes;
use rand::seq::SliceRandom;
use shale_buffer::{BufferPool, BufferPoolConfig};
use shale_common::config::ReplacementPolicy;
use shale_common::{RecordId, PAGE_SIZE};
use shale_storage::index::builder::entries_from_scan;
use shale_storage::index::page::{leaf_capacity, InternalPage, LeafPage};
use shale_storage::{
    build_bulk_load, build_from_existing, build_incremental, KeyType, PagedFiles, RecordFile,
};
use std::sync::Arc;
use tempfile::tempdir;

const KEY_LEN: u16 = 20;

fn setup(num_frames: usize) -> (Arc<PagedFiles>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let pool = Arc::new(
        BufferPool::new(BufferPoolConfig {
            num_frames,
            policy: ReplacementPolicy::Lru,
        })
        .unwrap(),
    );
    (Arc::new(PagedFiles::new(pool, false)), dir)
}

/// A 20-byte fixed-width key, zero padded.
fn make_key(i: u32) -> Bytes {
    let mut key = format!("S{i:08}").into_bytes();
    key.resize(KEY_LEN as usize, 0);
    Bytes::from(key)
}

// =============================================================================
// Scenario: buffer-pool miss/hit accounting through the paged file store
// =============================================================================

#[test]
fn test_miss_hit_accounting_through_file_store() {
    let (files, dir) = setup(4);
    let path = dir.path().join("pages.db");
    files.create(&path).unwrap();

    // Materialize 10 data pages.
    let fd = files.open(&path).unwrap();
    for _ in 0..10 {
        let (n, _) = files.alloc_page(fd).unwrap();
        files.unpin(fd, n, true).unwrap();
    }
    files.close(fd).unwrap();

    let fd = files.open(&path).unwrap();
    files.pool().reset_stats();

    for page in [0u32, 1, 0] {
        files.get_page(fd, page).unwrap();
        files.unpin(fd, page, false).unwrap();
    }

    let stats = files.pool().stats();
    assert_eq!(stats.logical_reads, 3);
    assert_eq!(stats.buffer_misses, 2);
    assert_eq!(stats.buffer_hits, 1);
    assert_eq!(stats.physical_reads, 2);
    assert_eq!(stats.physical_writes, 0);
    assert!((stats.hit_ratio() - 1.0 / 3.0).abs() < 1e-9);

    files.close(fd).unwrap();
}

// =============================================================================
// Scenario: LRU vs MRU victim selection
// =============================================================================

#[test]
fn test_lru_vs_mru_victims() {
    for (policy, evicted, survivor) in [
        (ReplacementPolicy::Lru, 0u32, 2u32),
        (ReplacementPolicy::Mru, 2, 0),
    ] {
        let (files, dir) = setup(3);
        files.pool().set_policy(policy);
        let path = dir.path().join("pages.db");
        files.create(&path).unwrap();

        let fd = files.open(&path).unwrap();
        for _ in 0..4 {
            let (n, _) = files.alloc_page(fd).unwrap();
            files.unpin(fd, n, true).unwrap();
        }
        files.close(fd).unwrap();

        let fd = files.open(&path).unwrap();
        files.pool().reset_stats();
        for page in 0..4u32 {
            files.get_page(fd, page).unwrap();
            files.unpin(fd, page, false).unwrap();
        }

        // Bringing in page 3 chose a victim per the policy.
        files.pool().reset_stats();
        files.get_page(fd, survivor).unwrap();
        files.unpin(fd, survivor, false).unwrap();
        assert_eq!(
            files.pool().stats().buffer_hits,
            1,
            "{policy}: survivor should still be cached"
        );

        files.get_page(fd, evicted).unwrap();
        files.unpin(fd, evicted, false).unwrap();
        assert_eq!(
            files.pool().stats().buffer_misses,
            1,
            "{policy}: evicted page should miss"
        );

        files.close(fd).unwrap();
    }
}

// =============================================================================
// Scenario: record-file round trip at scale
// =============================================================================

#[test]
fn test_record_file_round_trip_10k() {
    // A pool large enough to keep the whole file resident; the first-fit
    // insert revisits every page, which would otherwise thrash.
    let (files, dir) = setup(300);
    let path = dir.path().join("records.db");
    RecordFile::create(&files, &path).unwrap();
    let rf = RecordFile::open(files.clone(), &path).unwrap();

    let record_for = |i: usize| -> Vec<u8> {
        // 97 bytes: a recognizable prefix plus filler.
        let mut rec = format!("record-{i:06};").into_bytes();
        rec.resize(97, b'x');
        rec
    };

    let mut rids = Vec::with_capacity(10_000);
    for i in 0..10_000 {
        rids.push(rf.insert(&record_for(i)).unwrap());
    }

    let stats = rf.space_stats().unwrap();
    assert_eq!(stats.num_records, 10_000);
    assert!(
        (245..=275).contains(&stats.total_pages),
        "unexpected page count {}",
        stats.total_pages
    );
    assert!(
        stats.utilization() > 0.92 && stats.utilization() < 0.96,
        "unexpected utilization {}",
        stats.utilization()
    );

    // Every record comes back by id and the scan yields all of them in
    // insertion order within each page.
    assert_eq!(rf.get(rids[1234]).unwrap(), record_for(1234).as_slice());

    let scanned = rf.scan().unwrap();
    assert_eq!(scanned.len(), 10_000);
    let mut last: Option<RecordId> = None;
    for (rid, _) in &scanned {
        if let Some(prev) = last {
            if prev.page_num == rid.page_num {
                assert!(rid.slot > prev.slot);
            } else {
                assert!(rid.page_num > prev.page_num);
            }
        }
        last = Some(*rid);
    }

    rf.close().unwrap();
}

// =============================================================================
// Scenario: fragmentation and compaction through the record file
// =============================================================================

#[test]
fn test_fragmentation_and_compaction() {
    let (files, dir) = setup(8);
    let path = dir.path().join("records.db");
    RecordFile::create(&files, &path).unwrap();
    let rf = RecordFile::open(files.clone(), &path).unwrap();

    let rids: Vec<RecordId> = [100usize, 200, 50, 300]
        .iter()
        .map(|&size| rf.insert(&vec![0u8; size]).unwrap())
        .collect();
    assert_eq!(rids.iter().map(|r| r.slot).collect::<Vec<_>>(), [0, 1, 2, 3]);

    rf.delete(rids[0]).unwrap();
    rf.delete(rids[2]).unwrap();

    let stats = rf.space_stats().unwrap();
    assert_eq!(stats.fragmented_bytes, 150);

    // A 120-byte record reuses the lowest tombstone.
    let rid = rf.insert(&vec![7u8; 120]).unwrap();
    assert_eq!(rid.slot, 0);

    rf.compact_page(0).unwrap();
    let stats = rf.space_stats().unwrap();
    assert_eq!(stats.fragmented_bytes, 0);
    assert_eq!(stats.num_records, 3);
    assert_eq!(stats.slot_overhead, 12);

    rf.close().unwrap();
}

// =============================================================================
// Scenario: bulk-load correctness
// =============================================================================

#[test]
fn test_bulk_load_ordering_and_links() {
    let (files, dir) = setup(32);
    let name = dir.path().join("students");

    let n: u32 = 5_000;
    let mut entries: Vec<(Bytes, RecordId)> = (0..n)
        .map(|i| (make_key(i), RecordId::new(i / 40, (i % 40) as u16)))
        .collect();
    entries.shuffle(&mut rand::thread_rng());

    let index =
        build_bulk_load(&files, &name, 0, KeyType::Char, KEY_LEN, entries, 0.9).unwrap();

    let per_leaf = (leaf_capacity(KEY_LEN as usize) as f64 * 0.9) as usize;
    let expected_leaves = (n as usize).div_ceil(per_leaf);

    // Walking the linked leaves yields every key in ascending order.
    let scanned = index.scan_entries().unwrap();
    assert_eq!(scanned.len(), n as usize);
    for window in scanned.windows(2) {
        assert!(window[0].0 < window[1].0);
    }

    // Check the leaf level page by page: fill, links, terminator.
    let meta = index.meta();
    assert_eq!(meta.num_entries, n as u64);
    assert_eq!(meta.height, 2);

    let root_page = meta.root_page as u32;
    let fd = index.fd();

    let (left_child, separators) = {
        let frame = files.get_page(fd, root_page).unwrap();
        let data = frame.read_data();
        let root = InternalPage::read(&data[..]).unwrap();
        let seps: Vec<(Bytes, u32)> = (0..root.key_count())
            .map(|i| (Bytes::copy_from_slice(root.key(i)), root.child(i)))
            .collect();
        let left = root.left_child();
        drop(data);
        files.unpin(fd, root_page, false).unwrap();
        (left, seps)
    };
    assert_eq!(separators.len() + 1, expected_leaves);

    // Every separator is strictly greater than the last key of the child
    // to its left.
    let mut chain = vec![left_child];
    chain.extend(separators.iter().map(|(_, child)| *child));
    for (i, (sep, _)) in separators.iter().enumerate() {
        let left_leaf = chain[i];
        let frame = files.get_page(fd, left_leaf).unwrap();
        let last_key = {
            let data = frame.read_data();
            let leaf = LeafPage::read(&data[..]).unwrap();
            Bytes::copy_from_slice(leaf.key(leaf.key_count() - 1))
        };
        files.unpin(fd, left_leaf, false).unwrap();
        assert!(*sep > last_key, "separator {i} not above left child");
    }

    // Leaves are linked left-to-right and terminated with -1.
    let mut leaves_seen = 0;
    let mut page = chain[0] as i32;
    while page != -1 {
        let frame = files.get_page(fd, page as u32).unwrap();
        let next = {
            let data = frame.read_data();
            let leaf = LeafPage::read(&data[..]).unwrap();
            assert!(leaf.key_count() <= per_leaf);
            leaf.next_leaf()
        };
        files.unpin(fd, page as u32, false).unwrap();
        leaves_seen += 1;
        page = next;
    }
    assert_eq!(leaves_seen, expected_leaves);

    index.close().unwrap();
}

#[test]
fn test_bulk_load_empty_input() {
    let (files, dir) = setup(8);
    let name = dir.path().join("empty");

    let index =
        build_bulk_load(&files, &name, 0, KeyType::Char, KEY_LEN, Vec::new(), 0.9).unwrap();
    assert_eq!(index.meta().num_entries, 0);
    assert_eq!(index.lookup(&make_key(1)).unwrap(), None);
    index.close().unwrap();
}

#[test]
fn test_bulk_load_rejects_bad_fill_factor() {
    let (files, dir) = setup(8);
    let name = dir.path().join("bad");

    assert!(build_bulk_load(&files, &name, 0, KeyType::Char, KEY_LEN, Vec::new(), 0.0).is_err());
    assert!(build_bulk_load(&files, &name, 0, KeyType::Char, KEY_LEN, Vec::new(), 1.5).is_err());
}

// =============================================================================
// Scenario: three-strategy equivalence
// =============================================================================

#[test]
fn test_strategy_equivalence() {
    let (files, dir) = setup(64);

    let n: u32 = 1_000;
    let mut entries: Vec<(Bytes, RecordId)> = (0..n)
        .map(|i| (make_key(i), RecordId::new(i / 40, (i % 40) as u16)))
        .collect();
    entries.shuffle(&mut rand::thread_rng());

    files.pool().reset_stats();
    let by_scan = build_from_existing(
        &files,
        &dir.path().join("m1"),
        0,
        KeyType::Char,
        KEY_LEN,
        &entries,
    )
    .unwrap();
    let scan_writes = files.pool().stats().logical_writes;

    files.pool().reset_stats();
    let incremental = build_incremental(
        &files,
        &dir.path().join("m2"),
        0,
        KeyType::Char,
        KEY_LEN,
        entries.clone(),
    )
    .unwrap();
    let incremental_writes = files.pool().stats().logical_writes;

    files.pool().reset_stats();
    let bulk = build_bulk_load(
        &files,
        &dir.path().join("m3"),
        0,
        KeyType::Char,
        KEY_LEN,
        entries.clone(),
        0.9,
    )
    .unwrap();
    let bulk_writes = files.pool().stats().logical_writes;

    // Every probe agrees across the three builds.
    for (key, rid) in &entries {
        assert_eq!(by_scan.lookup(key).unwrap(), Some(*rid));
        assert_eq!(incremental.lookup(key).unwrap(), Some(*rid));
        assert_eq!(bulk.lookup(key).unwrap(), Some(*rid));
    }

    // Bulk load writes each tree page exactly once (plus the metadata
    // page at create and close); the insertion strategies rewrite pages
    // on every insert and split.
    let bulk_pages = files.num_pages(bulk.fd()).unwrap() as u64;
    assert_eq!(bulk_writes, bulk_pages + 1);
    assert!(scan_writes > bulk_writes);
    assert!(incremental_writes > bulk_writes);

    by_scan.close().unwrap();
    incremental.close().unwrap();
    bulk.close().unwrap();
}

// =============================================================================
// Scenario: full data path, records to index probes
// =============================================================================

#[test]
fn test_records_to_index_data_path() {
    let (files, dir) = setup(32);
    let path = dir.path().join("students.db");
    RecordFile::create(&files, &path).unwrap();
    let rf = RecordFile::open(files.clone(), &path).unwrap();

    // Records carry their key in the first 20 bytes.
    let n: u32 = 800;
    let mut order: Vec<u32> = (0..n).collect();
    order.shuffle(&mut rand::thread_rng());

    let mut expected: Vec<(Bytes, RecordId)> = Vec::with_capacity(n as usize);
    for &i in &order {
        let mut record = make_key(i).to_vec();
        record.extend_from_slice(format!(";student-{i};payload").as_bytes());
        let rid = rf.insert(&record).unwrap();
        expected.push((make_key(i), rid));
    }

    // Extract (key, rid) pairs from a scan, as an index build would.
    let scanned = rf.scan().unwrap();
    let entries = entries_from_scan(&scanned, |bytes| {
        Some(Bytes::copy_from_slice(&bytes[..KEY_LEN as usize]))
    });
    assert_eq!(entries.len(), n as usize);

    let index = build_bulk_load(
        &files,
        &dir.path().join("students.ix"),
        0,
        KeyType::Char,
        KEY_LEN,
        entries,
        0.9,
    )
    .unwrap();

    for (key, rid) in &expected {
        let found = index.lookup(key).unwrap();
        assert_eq!(found, Some(*rid));
        // The index points back at the right record.
        let record = rf.get(*rid).unwrap();
        assert_eq!(&record[..KEY_LEN as usize], &key[..]);
    }

    index.close().unwrap();
    rf.close().unwrap();
}

// =============================================================================
// Scenario: small pool survives an index build (pin discipline)
// =============================================================================

#[test]
fn test_index_build_under_tiny_pool() {
    // Three frames are enough: the build never holds more than one pin.
    let (files, dir) = setup(3);
    let name = dir.path().join("tiny");

    let mut entries: Vec<(Bytes, RecordId)> = (0..500u32)
        .map(|i| (make_key(i), RecordId::new(i, 0)))
        .collect();
    entries.shuffle(&mut rand::thread_rng());

    let index =
        build_from_existing(&files, &name, 0, KeyType::Char, KEY_LEN, &entries).unwrap();

    for (key, rid) in entries.iter().take(50) {
        assert_eq!(index.lookup(key).unwrap(), Some(*rid));
    }
    index.close().unwrap();
}

// =============================================================================
// Boundary: maximum record size through the full stack
// =============================================================================

#[test]
fn test_max_record_boundary() {
    let (files, dir) = setup(8);
    let path = dir.path().join("records.db");
    RecordFile::create(&files, &path).unwrap();
    let rf = RecordFile::open(files.clone(), &path).unwrap();

    let max = PAGE_SIZE - 32 - 4;
    let rid = rf.insert(&vec![1u8; max]).unwrap();
    assert_eq!(rf.get(rid).unwrap().len(), max);

    assert!(rf.insert(&vec![1u8; max + 1]).is_err());

    rf.close().unwrap();
}
