//! Paged file store.
//!
//! A paged file is one 4096-byte header page followed by contiguous
//! 4096-byte data pages; data page N lives at byte offset
//! `FILE_HEADER_SIZE + N * PAGE_SIZE`. The header records the page count
//! and the head of the disposed-page chain; disposed pages link to the
//! next free page through their first four bytes.
//!
//! All page traffic goes through the buffer pool. Every successful
//! `alloc_page`/`get_page` pins the page and must be balanced by exactly
//! one `unpin`.

use parking_lot::Mutex;
use shale_buffer::{BufferFrame, BufferPool, PageIo};
use shale_common::page::{PageId, FILE_HEADER_SIZE, PAGE_SIZE};
use shale_common::{Result, ShaleError};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Maximum number of simultaneously open files.
pub const MAX_OPEN_FILES: usize = 20;

/// Sentinel marking the end of the disposed-page chain.
const NO_FREE_PAGE: i32 = -1;

/// Handle of an open paged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// File header contents: page count and disposed-page chain head.
#[derive(Debug, Clone, Copy)]
struct FileHeader {
    num_pages: u32,
    free_head: i32,
}

impl FileHeader {
    fn new() -> Self {
        Self {
            num_pages: 0,
            free_head: NO_FREE_PAGE,
        }
    }

    fn to_bytes(self) -> Box<[u8; FILE_HEADER_SIZE]> {
        let mut buf = Box::new([0u8; FILE_HEADER_SIZE]);
        buf[0..4].copy_from_slice(&self.num_pages.to_le_bytes());
        buf[4..8].copy_from_slice(&self.free_head.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            num_pages: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            free_head: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// An open paged file.
struct OpenFile {
    file: File,
    path: PathBuf,
    header: FileHeader,
    header_dirty: bool,
    /// Pages currently on the disposed chain, rebuilt at open.
    free_pages: HashSet<u32>,
}

impl OpenFile {
    fn page_offset(page_num: u32) -> u64 {
        FILE_HEADER_SIZE as u64 + page_num as u64 * PAGE_SIZE as u64
    }
}

/// Fixed-capacity table of open files. Implements [`PageIo`] so the buffer
/// pool can read misses and write back dirty victims of any open file.
struct FileTable {
    slots: Vec<Option<OpenFile>>,
}

impl FileTable {
    fn new() -> Self {
        Self {
            slots: (0..MAX_OPEN_FILES).map(|_| None).collect(),
        }
    }

    fn slot(&self, fd: FileId) -> Result<&OpenFile> {
        self.slots
            .get(fd.0 as usize)
            .and_then(|s| s.as_ref())
            .ok_or(ShaleError::BadHandle { handle: fd.0 })
    }

    fn slot_mut(&mut self, fd: FileId) -> Result<&mut OpenFile> {
        self.slots
            .get_mut(fd.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(ShaleError::BadHandle { handle: fd.0 })
    }

    fn is_open(&self, path: &Path) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|open| open.path == path)
    }
}

impl PageIo for FileTable {
    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let open = self.slot_mut(FileId(page_id.file_id))?;
        open.file
            .seek(SeekFrom::Start(OpenFile::page_offset(page_id.page_num)))?;
        match open.file.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(ShaleError::ShortRead { page: page_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> Result<()> {
        let open = self.slot_mut(FileId(page_id.file_id))?;
        open.file
            .seek(SeekFrom::Start(OpenFile::page_offset(page_id.page_num)))?;
        open.file.write_all(buf)?;
        Ok(())
    }
}

/// The paged file store.
///
/// Owns the open-file table and routes every page access through the
/// buffer pool handle it was built with.
pub struct PagedFiles {
    pool: Arc<BufferPool>,
    fsync_enabled: bool,
    inner: Mutex<FileTable>,
}

impl PagedFiles {
    /// Creates a paged file store over the given buffer pool.
    pub fn new(pool: Arc<BufferPool>, fsync_enabled: bool) -> Self {
        Self {
            pool,
            fsync_enabled,
            inner: Mutex::new(FileTable::new()),
        }
    }

    /// Returns the buffer pool this store runs on.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Creates a new paged file with an empty header.
    pub fn create(&self, path: &Path) -> Result<()> {
        if self.inner.lock().is_open(path) {
            return Err(ShaleError::FileOpen(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(&FileHeader::new().to_bytes()[..])?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        debug!(path = %path.display(), "created paged file");
        Ok(())
    }

    /// Removes a paged file from disk. The file must not be open.
    pub fn destroy(&self, path: &Path) -> Result<()> {
        if self.inner.lock().is_open(path) {
            return Err(ShaleError::FileOpen(path.to_path_buf()));
        }
        std::fs::remove_file(path)?;
        debug!(path = %path.display(), "destroyed paged file");
        Ok(())
    }

    /// Opens a paged file and returns its handle.
    ///
    /// Fails with `FileOpen` if the file is already open and with
    /// `FileTableFull` when no handle is available.
    pub fn open(&self, path: &Path) -> Result<FileId> {
        let mut table = self.inner.lock();

        if table.is_open(path) {
            return Err(ShaleError::FileOpen(path.to_path_buf()));
        }
        let slot = table
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(ShaleError::FileTableFull {
                capacity: MAX_OPEN_FILES,
            })?;

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header_buf = vec![0u8; FILE_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        match file.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(ShaleError::HeaderRead(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }
        let header = FileHeader::from_bytes(&header_buf);

        // Rebuild the disposed-page set by walking the chain.
        let mut free_pages = HashSet::new();
        let mut cursor = header.free_head;
        while cursor != NO_FREE_PAGE {
            let page = cursor as u32;
            if page >= header.num_pages || !free_pages.insert(page) {
                return Err(ShaleError::InvalidPage { page });
            }
            let mut link = [0u8; 4];
            file.seek(SeekFrom::Start(OpenFile::page_offset(page)))?;
            file.read_exact(&mut link)?;
            cursor = i32::from_le_bytes(link);
        }

        table.slots[slot] = Some(OpenFile {
            file,
            path: path.to_path_buf(),
            header,
            header_dirty: false,
            free_pages,
        });

        let fd = FileId(slot as u32);
        debug!(path = %path.display(), %fd, "opened paged file");
        Ok(fd)
    }

    /// Closes an open file.
    ///
    /// Flushes every dirty buffered page of the file and writes the header
    /// back. Fails with `PageFixed` if any page of the file is still
    /// pinned; no dirty frame survives a successful close.
    pub fn close(&self, fd: FileId) -> Result<()> {
        let mut table = self.inner.lock();
        table.slot(fd)?;

        self.pool.release_file(fd.0, &mut *table)?;

        let fsync = self.fsync_enabled;
        let open = table.slot_mut(fd)?;
        if open.header_dirty {
            let bytes = open.header.to_bytes();
            open.file.seek(SeekFrom::Start(0))?;
            open.file.write_all(&bytes[..])?;
            open.header_dirty = false;
        }
        if fsync {
            open.file.sync_all()?;
        }
        let path = open.path.clone();
        table.slots[fd.0 as usize] = None;
        debug!(path = %path.display(), %fd, "closed paged file");
        Ok(())
    }

    /// Returns the number of data pages in an open file, disposed pages
    /// included.
    pub fn num_pages(&self, fd: FileId) -> Result<u32> {
        Ok(self.inner.lock().slot(fd)?.header.num_pages)
    }

    /// Allocates a page, pinning it.
    ///
    /// Reuses the head of the disposed chain if one exists, otherwise
    /// extends the file. The returned buffer is zero-filled and already
    /// marked dirty so the fresh contents reach disk.
    pub fn alloc_page(&self, fd: FileId) -> Result<(u32, &BufferFrame)> {
        let mut table = self.inner.lock();

        let free_head = table.slot(fd)?.header.free_head;
        if free_head != NO_FREE_PAGE {
            // Reuse a disposed page; its first four bytes hold the chain link.
            let page_num = free_head as u32;
            let page_id = PageId::new(fd.0, page_num);
            let frame = self.pool.get(page_id, &mut *table)?;
            let next = {
                let data = frame.read_data();
                i32::from_le_bytes([data[0], data[1], data[2], data[3]])
            };
            frame.write_data().fill(0);
            self.pool.mark_used(page_id)?;

            let open = table.slot_mut(fd)?;
            open.header.free_head = next;
            open.free_pages.remove(&page_num);
            open.header_dirty = true;
            return Ok((page_num, frame));
        }

        let page_num = {
            let open = table.slot_mut(fd)?;
            let n = open.header.num_pages;
            open.header.num_pages = n + 1;
            open.header_dirty = true;
            n
        };
        let page_id = PageId::new(fd.0, page_num);
        let frame = self.pool.alloc(page_id, &mut *table)?;
        self.pool.mark_used(page_id)?;
        Ok((page_num, frame))
    }

    /// Fetches an existing page, pinning it.
    ///
    /// Fails with `InvalidPage` for out-of-range or disposed pages and
    /// with `PageFixed` if the page is already pinned.
    pub fn get_page(&self, fd: FileId, page_num: u32) -> Result<&BufferFrame> {
        let mut table = self.inner.lock();
        {
            let open = table.slot(fd)?;
            if page_num >= open.header.num_pages || open.free_pages.contains(&page_num) {
                return Err(ShaleError::InvalidPage { page: page_num });
            }
        }
        self.pool.get(PageId::new(fd.0, page_num), &mut *table)
    }

    /// Unpins a page, optionally marking it dirty.
    pub fn unpin(&self, fd: FileId, page_num: u32, dirty: bool) -> Result<()> {
        self.inner.lock().slot(fd)?;
        self.pool.unpin(PageId::new(fd.0, page_num), dirty)
    }

    /// Marks a pinned page dirty without unpinning it.
    pub fn mark_dirty(&self, fd: FileId, page_num: u32) -> Result<()> {
        self.inner.lock().slot(fd)?;
        self.pool.mark_used(PageId::new(fd.0, page_num))
    }

    /// Logically frees a page, putting it on the disposed chain.
    ///
    /// Fails with `PageFixed` if the page is pinned and with
    /// `PageAlreadyFree` if it is already on the chain.
    pub fn dispose_page(&self, fd: FileId, page_num: u32) -> Result<()> {
        let mut table = self.inner.lock();

        let old_head = {
            let open = table.slot(fd)?;
            if page_num >= open.header.num_pages {
                return Err(ShaleError::InvalidPage { page: page_num });
            }
            if open.free_pages.contains(&page_num) {
                return Err(ShaleError::PageAlreadyFree { page: page_num });
            }
            open.header.free_head
        };

        let page_id = PageId::new(fd.0, page_num);
        if self.pool.is_pinned(page_id) {
            return Err(ShaleError::PageFixed { page: page_id });
        }

        // Chain the page in through its first four bytes.
        let frame = self.pool.get(page_id, &mut *table)?;
        frame.write_data()[0..4].copy_from_slice(&old_head.to_le_bytes());
        self.pool.unpin(page_id, true)?;

        let open = table.slot_mut(fd)?;
        open.header.free_head = page_num as i32;
        open.free_pages.insert(page_num);
        open.header_dirty = true;
        Ok(())
    }
}

impl Drop for PagedFiles {
    fn drop(&mut self) {
        // Best-effort flush of anything still open.
        let mut table = self.inner.lock();
        let open_fds: Vec<u32> = table
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect();
        for fd in open_fds {
            let _ = self.pool.release_file(fd, &mut *table);
            if let Ok(open) = table.slot_mut(FileId(fd)) {
                if open.header_dirty {
                    let bytes = open.header.to_bytes();
                    let _ = open.file.seek(SeekFrom::Start(0));
                    let _ = open.file.write_all(&bytes[..]);
                }
            }
        }
    }
}
