//! Hash page directory mapping (file, page) to buffer frames.

use crate::frame::FrameId;
use shale_common::page::PageId;
use shale_common::{Result, ShaleError};

/// Collision-chained hash table keyed on `PageId`.
///
/// Used exclusively by the buffer pool for O(1) frame lookup. The bucket
/// count is fixed at construction, sized to the pool capacity; chains stay
/// short because the table never holds more entries than there are frames.
pub struct PageTable {
    buckets: Vec<Vec<(PageId, FrameId)>>,
    len: usize,
}

impl PageTable {
    /// Creates a page directory sized for the given number of frames.
    pub fn new(capacity: usize) -> Self {
        let num_buckets = capacity.max(1);
        Self {
            buckets: (0..num_buckets).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    #[inline]
    fn bucket_index(&self, page_id: PageId) -> usize {
        // Fibonacci-style multiply for distribution
        let hash = page_id.as_u64().wrapping_mul(0x517cc1b727220a95);
        (hash % self.buckets.len() as u64) as usize
    }

    /// Looks up a page and returns its frame if present.
    pub fn find(&self, page_id: PageId) -> Option<FrameId> {
        let bucket = &self.buckets[self.bucket_index(page_id)];
        bucket
            .iter()
            .find(|(pid, _)| *pid == page_id)
            .map(|(_, fid)| *fid)
    }

    /// Inserts a page to frame mapping.
    ///
    /// Fails with `HashDuplicate` if the page is already present.
    pub fn insert(&mut self, page_id: PageId, frame_id: FrameId) -> Result<()> {
        let idx = self.bucket_index(page_id);
        let bucket = &mut self.buckets[idx];
        if bucket.iter().any(|(pid, _)| *pid == page_id) {
            return Err(ShaleError::HashDuplicate { page: page_id });
        }
        bucket.push((page_id, frame_id));
        self.len += 1;
        Ok(())
    }

    /// Removes a page mapping, returning its frame.
    ///
    /// Fails with `HashNotFound` if the page is absent.
    pub fn remove(&mut self, page_id: PageId) -> Result<FrameId> {
        let idx = self.bucket_index(page_id);
        let bucket = &mut self.buckets[idx];
        let pos = bucket
            .iter()
            .position(|(pid, _)| *pid == page_id)
            .ok_or(ShaleError::HashNotFound { page: page_id })?;
        let (_, frame_id) = bucket.swap_remove(pos);
        self.len -= 1;
        Ok(frame_id)
    }

    /// Returns true if the page is in the directory.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.find(page_id).is_some()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
