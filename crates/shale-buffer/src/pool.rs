//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::RecencyList;
use parking_lot::Mutex;
use shale_common::config::ReplacementPolicy;
use shale_common::page::PageId;
use shale_common::{Result, ShaleError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Physical page I/O callbacks used by the buffer pool.
///
/// The pool itself never touches the disk; it reads missed pages and
/// writes back dirty victims through this seam. An implementation must be
/// able to resolve any `PageId` of a currently open file, since an
/// eviction may write back a page of a different file than the one being
/// fetched.
pub trait PageIo {
    /// Reads one page into `buf` (exactly `PAGE_SIZE` bytes).
    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Writes one page from `buf` (exactly `PAGE_SIZE` bytes).
    fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> Result<()>;
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Initial replacement policy.
    pub policy: ReplacementPolicy,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 20,
            policy: ReplacementPolicy::Lru,
        }
    }
}

/// Snapshot of the pool's I/O accounting counters.
///
/// Logical I/O counts calls into the pool; physical I/O counts actual disk
/// transfers (misses, and write-back of dirty frames on eviction or file
/// release). At any quiescent point `logical_reads == buffer_hits +
/// buffer_misses` and `physical_reads <= buffer_misses`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub logical_reads: u64,
    pub logical_writes: u64,
    pub physical_reads: u64,
    pub physical_writes: u64,
    pub buffer_hits: u64,
    pub buffer_misses: u64,
}

impl BufferStats {
    /// Fraction of fetches served from the pool.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.buffer_hits + self.buffer_misses;
        if total == 0 {
            0.0
        } else {
            self.buffer_hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    logical_reads: AtomicU64,
    logical_writes: AtomicU64,
    physical_reads: AtomicU64,
    physical_writes: AtomicU64,
    buffer_hits: AtomicU64,
    buffer_misses: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BufferStats {
        BufferStats {
            logical_reads: self.logical_reads.load(Ordering::Relaxed),
            logical_writes: self.logical_writes.load(Ordering::Relaxed),
            physical_reads: self.physical_reads.load(Ordering::Relaxed),
            physical_writes: self.physical_writes.load(Ordering::Relaxed),
            buffer_hits: self.buffer_hits.load(Ordering::Relaxed),
            buffer_misses: self.buffer_misses.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.logical_reads.store(0, Ordering::Relaxed);
        self.logical_writes.store(0, Ordering::Relaxed);
        self.physical_reads.store(0, Ordering::Relaxed);
        self.physical_writes.store(0, Ordering::Relaxed);
        self.buffer_hits.store(0, Ordering::Relaxed);
        self.buffer_misses.store(0, Ordering::Relaxed);
    }
}

/// Bookkeeping behind the pool mutex: the page directory, the recency
/// lists and the active replacement policy.
struct PoolInner {
    table: PageTable,
    lists: RecencyList,
    policy: ReplacementPolicy,
}

/// Buffer pool manager.
///
/// Caches up to `num_frames` pages with a strict pin discipline: every
/// successful `get`/`alloc` must be balanced by exactly one `unpin`, a
/// pinned frame is never evicted, and fetching a page that is already
/// pinned fails with `PageFixed`. Dirty frames are written back through
/// the caller-supplied [`PageIo`] when evicted or released.
pub struct BufferPool {
    frames: Vec<BufferFrame>,
    inner: Mutex<PoolInner>,
    counters: Counters,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(config: BufferPoolConfig) -> Result<Self> {
        if config.num_frames == 0 {
            return Err(ShaleError::Config(
                "buffer pool needs at least one frame".to_string(),
            ));
        }

        let frames: Vec<_> = (0..config.num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        Ok(Self {
            frames,
            inner: Mutex::new(PoolInner {
                table: PageTable::new(config.num_frames),
                lists: RecencyList::new(config.num_frames),
                policy: config.policy,
            }),
            counters: Counters::default(),
        })
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.inner.lock().lists.free_count()
    }

    /// Returns the number of pages currently cached.
    pub fn page_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Checks whether a page is cached.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().table.contains(page_id)
    }

    /// Checks whether a page is cached and pinned.
    pub fn is_pinned(&self, page_id: PageId) -> bool {
        let inner = self.inner.lock();
        match inner.table.find(page_id) {
            Some(frame_id) => self.frames[frame_id.0 as usize].is_pinned(),
            None => false,
        }
    }

    /// Returns the active replacement policy.
    pub fn policy(&self) -> ReplacementPolicy {
        self.inner.lock().policy
    }

    /// Switches the replacement policy. Applies to subsequent evictions.
    pub fn set_policy(&self, policy: ReplacementPolicy) {
        self.inner.lock().policy = policy;
    }

    /// Returns a snapshot of the I/O counters.
    pub fn stats(&self) -> BufferStats {
        self.counters.snapshot()
    }

    /// Zeroes all I/O counters.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Fetches an existing page, pinning it.
    ///
    /// On a hit the cached frame is returned; fetching a page that is
    /// already pinned fails with `PageFixed` (the hit is still counted).
    /// On a miss a frame is allocated (possibly evicting an unpinned
    /// victim, writing it back first if dirty) and the page is read
    /// through `io`.
    pub fn get(&self, page_id: PageId, io: &mut dyn PageIo) -> Result<&BufferFrame> {
        self.counters.logical_reads.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if let Some(frame_id) = inner.table.find(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            self.counters.buffer_hits.fetch_add(1, Ordering::Relaxed);
            if frame.is_pinned() {
                return Err(ShaleError::PageFixed { page: page_id });
            }
            frame.pin();
            return Ok(frame);
        }

        self.counters.buffer_misses.fetch_add(1, Ordering::Relaxed);
        let frame_id = self.allocate_frame(&mut inner, io)?;
        let frame = &self.frames[frame_id.0 as usize];

        let read_result = {
            let mut data = frame.write_data();
            io.read_page(page_id, &mut data[..])
        };
        if let Err(e) = read_result {
            // Failed read: put the frame back on the free list.
            inner.lists.unlink(frame_id);
            inner.lists.push_free(frame_id);
            return Err(e);
        }
        self.counters.physical_reads.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = inner.table.insert(page_id, frame_id) {
            inner.lists.unlink(frame_id);
            inner.lists.push_free(frame_id);
            return Err(e);
        }

        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        Ok(frame)
    }

    /// Allocates a frame for a brand-new page, pinning it.
    ///
    /// The buffer is zero-filled and no read is issued; the caller owns
    /// the page's initial contents. Fails with `HashDuplicate` if the page
    /// is already cached.
    pub fn alloc(&self, page_id: PageId, io: &mut dyn PageIo) -> Result<&BufferFrame> {
        let mut inner = self.inner.lock();

        if inner.table.contains(page_id) {
            return Err(ShaleError::HashDuplicate { page: page_id });
        }

        let frame_id = self.allocate_frame(&mut inner, io)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.write_data().fill(0);

        if let Err(e) = inner.table.insert(page_id, frame_id) {
            inner.lists.unlink(frame_id);
            inner.lists.push_free(frame_id);
            return Err(e);
        }

        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        Ok(frame)
    }

    /// Unpins a page, optionally marking it dirty.
    ///
    /// Relinks the frame to the head of the used list, making it the most
    /// recently used. A dirty unpin is counted as a logical write.
    pub fn unpin(&self, page_id: PageId, dirty: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame_id = inner
            .table
            .find(page_id)
            .ok_or(ShaleError::PageNotInBuffer { page: page_id })?;
        let frame = &self.frames[frame_id.0 as usize];

        if !frame.is_pinned() {
            return Err(ShaleError::PageUnfixed { page: page_id });
        }

        if dirty {
            frame.set_dirty(true);
            self.counters.logical_writes.fetch_add(1, Ordering::Relaxed);
        }
        frame.unpin();
        inner.lists.move_to_head(frame_id);
        Ok(())
    }

    /// Marks a pinned page dirty and makes it the most recently used.
    pub fn mark_used(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame_id = inner
            .table
            .find(page_id)
            .ok_or(ShaleError::PageNotInBuffer { page: page_id })?;
        let frame = &self.frames[frame_id.0 as usize];

        if !frame.is_pinned() {
            return Err(ShaleError::PageUnfixed { page: page_id });
        }

        frame.set_dirty(true);
        inner.lists.move_to_head(frame_id);
        Ok(())
    }

    /// Releases every cached page of a file, writing dirty frames back.
    ///
    /// Fails with `PageFixed` before touching anything if any page of the
    /// file is still pinned. Released frames return to the free list.
    pub fn release_file(&self, file_id: u32, io: &mut dyn PageIo) -> Result<()> {
        let mut inner = self.inner.lock();

        let members: Vec<(FrameId, PageId)> = inner
            .lists
            .iter_mru()
            .filter_map(|frame_id| {
                let page_id = self.frames[frame_id.0 as usize].page_id()?;
                (page_id.file_id == file_id).then_some((frame_id, page_id))
            })
            .collect();

        for (frame_id, page_id) in &members {
            if self.frames[frame_id.0 as usize].is_pinned() {
                return Err(ShaleError::PageFixed { page: *page_id });
            }
        }

        for (frame_id, page_id) in &members {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.read_data();
                io.write_page(*page_id, &data[..])?;
                drop(data);
                self.counters.physical_writes.fetch_add(1, Ordering::Relaxed);
                frame.set_dirty(false);
            }
            inner.table.remove(*page_id)?;
            inner.lists.unlink(*frame_id);
            frame.reset();
            inner.lists.push_free(*frame_id);
        }

        debug!(file_id, released = members.len(), "released file from buffer pool");
        Ok(())
    }

    /// Allocates a frame for a new resident page.
    ///
    /// Takes a free frame if one exists, otherwise evicts the victim the
    /// active policy selects: the first unpinned frame scanning the used
    /// list from the tail (LRU) or from the head (MRU). A dirty victim is
    /// written back before its slot is reused. The chosen frame ends up
    /// linked at the head of the used list.
    fn allocate_frame(&self, inner: &mut PoolInner, io: &mut dyn PageIo) -> Result<FrameId> {
        if let Some(frame_id) = inner.lists.pop_free() {
            inner.lists.link_head(frame_id);
            return Ok(frame_id);
        }

        let victim = match inner.policy {
            ReplacementPolicy::Lru => inner
                .lists
                .iter_lru()
                .find(|f| !self.frames[f.0 as usize].is_pinned()),
            ReplacementPolicy::Mru => inner
                .lists
                .iter_mru()
                .find(|f| !self.frames[f.0 as usize].is_pinned()),
        };
        let victim = victim.ok_or(ShaleError::NoBuffer)?;

        let frame = &self.frames[victim.0 as usize];
        if let Some(victim_page) = frame.page_id() {
            if frame.is_dirty() {
                let data = frame.read_data();
                io.write_page(victim_page, &data[..])?;
                drop(data);
                self.counters.physical_writes.fetch_add(1, Ordering::Relaxed);
                frame.set_dirty(false);
                debug!(page = %victim_page, "wrote back dirty victim");
            }
            inner.table.remove(victim_page)?;
        }

        inner.lists.unlink(victim);
        inner.lists.link_head(victim);
        Ok(victim)
    }
}
