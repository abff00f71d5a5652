//! Index construction strategies.
//!
//! Three ways to materialize the same index format:
//!
//! 1. **Existing-file build** — scan an already-populated record file and
//!    feed every `(key, RecordId)` through the generic insertion
//!    primitive. Arrival order is file order, effectively random in key
//!    space, so the tree grows through repeated splits.
//! 2. **Incremental build** — records arrive one at a time and the index
//!    is updated per insert. Algorithmically identical to 1; kept as a
//!    separate driver because build comparisons report it separately.
//! 3. **Bulk load** — sort the entries, pack leaf pages sequentially at a
//!    target fill factor, then build the internal levels bottom-up. No
//!    insertion primitive runs and every page is written exactly once.

use super::page::{internal_capacity, leaf_capacity, InternalPageMut, LeafPageMut, NO_NEXT_LEAF};
use super::tree::{create_index, destroy_index, Index};
use super::KeyType;
use crate::file::PagedFiles;
use bytes::Bytes;
use shale_common::{RecordId, Result, ShaleError};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Default leaf fill factor for bulk loads.
pub const DEFAULT_FILL_FACTOR: f64 = 0.9;

/// Strategy 1: build an index over entries scanned from an existing file.
///
/// Every entry goes through the insertion primitive in the order given.
pub fn build_from_existing(
    files: &Arc<PagedFiles>,
    name: &Path,
    index_no: u32,
    key_type: KeyType,
    key_len: u16,
    entries: &[(Bytes, RecordId)],
) -> Result<Index> {
    create_index(files, name, index_no, key_type, key_len)?;
    let index = Index::open(files.clone(), name, index_no)?;
    for (key, rid) in entries {
        index.insert_entry(key, *rid)?;
    }
    info!(entries = entries.len(), "built index by file scan");
    Ok(index)
}

/// Strategy 2: build an index from records arriving one at a time.
///
/// Uses the same insertion primitive as [`build_from_existing`]; the
/// difference is the workload framing, not the algorithm.
pub fn build_incremental(
    files: &Arc<PagedFiles>,
    name: &Path,
    index_no: u32,
    key_type: KeyType,
    key_len: u16,
    entries: impl IntoIterator<Item = (Bytes, RecordId)>,
) -> Result<Index> {
    create_index(files, name, index_no, key_type, key_len)?;
    let index = Index::open(files.clone(), name, index_no)?;
    let mut count = 0u64;
    for (key, rid) in entries {
        index.insert_entry(&key, rid)?;
        count += 1;
    }
    info!(entries = count, "built index incrementally");
    Ok(index)
}

/// Strategy 3: sort the entries and bulk load the tree bottom-up.
///
/// Construction is all-or-nothing: any failure destroys the partially
/// built index file.
pub fn build_bulk_load(
    files: &Arc<PagedFiles>,
    name: &Path,
    index_no: u32,
    key_type: KeyType,
    key_len: u16,
    entries: Vec<(Bytes, RecordId)>,
    fill_factor: f64,
) -> Result<Index> {
    if !(fill_factor > 0.0 && fill_factor <= 1.0) {
        return Err(ShaleError::Config(format!(
            "fill factor {fill_factor} outside (0, 1]"
        )));
    }

    create_index(files, name, index_no, key_type, key_len)?;
    let index = Index::open(files.clone(), name, index_no)?;

    match bulk_load_into(&index, entries, fill_factor) {
        Ok(()) => Ok(index),
        Err(e) => {
            let _ = index.close();
            let _ = destroy_index(files, name, index_no);
            Err(e)
        }
    }
}

/// One built node of the current level: its page and its smallest key.
struct LevelNode {
    page: u32,
    first_key: Bytes,
}

fn bulk_load_into(
    index: &Index,
    mut entries: Vec<(Bytes, RecordId)>,
    fill_factor: f64,
) -> Result<()> {
    let meta = index.meta();
    let key_type = meta.key_type;
    let key_len = meta.key_len;

    for (key, _) in &entries {
        if key.len() != key_len as usize {
            return Err(ShaleError::KeyLengthMismatch {
                expected: key_len,
                actual: key.len(),
            });
        }
    }

    entries.sort_by(|(a, _), (b, _)| key_type.compare(a, b));

    let total = entries.len();
    if total == 0 {
        index.update_meta(|m| {
            m.root_page = -1;
            m.height = 0;
            m.num_entries = 0;
        });
        return index.sync_meta();
    }

    let leaf_cap = leaf_capacity(key_len as usize);
    let per_leaf = ((leaf_cap as f64 * fill_factor) as usize).max(1);
    let num_leaves = total.div_ceil(per_leaf);
    debug!(total, per_leaf, num_leaves, "bulk load: packing leaves");

    // Pack the sorted entries into linked leaves. Allocation on a fresh
    // index file is strictly sequential, so the next-leaf pointer of leaf
    // i is its own page number + 1.
    let mut level: Vec<LevelNode> = Vec::with_capacity(num_leaves);
    for (i, chunk) in entries.chunks(per_leaf).enumerate() {
        let last = i == num_leaves - 1;
        let (page, ()) = index.alloc_with(|page_num, data| {
            let next = if last {
                NO_NEXT_LEAF
            } else {
                page_num as i32 + 1
            };
            let mut leaf = LeafPageMut::init(data, key_len, per_leaf as u16, next);
            leaf.set_entries(chunk);
            Ok(())
        })?;
        if let Some(prev) = level.last() {
            debug_assert_eq!(page, prev.page + 1);
        }
        level.push(LevelNode {
            page,
            first_key: chunk[0].0.clone(),
        });
    }
    info!(num_leaves, "bulk load: leaf level built");

    // Build internal levels bottom-up until a single page remains. Each
    // node takes up to max_entries_per_internal + 1 children; separators
    // are the first key of the child to their right.
    let int_cap = internal_capacity(key_len as usize);
    let mut height = 1u16;
    while level.len() > 1 {
        let mut parents: Vec<LevelNode> = Vec::with_capacity(level.len() / (int_cap + 1) + 1);
        for group in level.chunks(int_cap + 1) {
            let (page, ()) = index.alloc_with(|_, data| {
                let mut node =
                    InternalPageMut::init(data, key_len, int_cap as u16, group[0].page);
                for child in &group[1..] {
                    node.push(&child.first_key, child.page);
                }
                Ok(())
            })?;
            parents.push(LevelNode {
                page,
                first_key: group[0].first_key.clone(),
            });
        }
        height += 1;
        debug!(
            nodes = parents.len(),
            level = height,
            "bulk load: internal level built"
        );
        level = parents;
    }

    let root = level[0].page;
    index.update_meta(|m| {
        m.root_page = root as i32;
        m.height = height;
        m.num_entries = total as u64;
    });
    index.sync_meta()?;
    info!(root, height, entries = total, "bulk load complete");
    Ok(())
}

/// Extracts `(key, RecordId)` pairs from scanned records.
///
/// `extract` pulls the fixed-width key out of a record's bytes; records it
/// returns `None` for are skipped.
pub fn entries_from_scan(
    records: &[(RecordId, Bytes)],
    extract: impl Fn(&[u8]) -> Option<Bytes>,
) -> Vec<(Bytes, RecordId)> {
    records
        .iter()
        .filter_map(|(rid, bytes)| extract(bytes).map(|key| (key, *rid)))
        .collect()
}
