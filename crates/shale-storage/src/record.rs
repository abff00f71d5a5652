//! Record file: variable-length records bound to slotted pages.
//!
//! A thin layer tying the slotted page codec to a paged file. Records are
//! opaque byte strings addressed by [`RecordId`]; inserts fill existing
//! pages first and append a fresh page when nothing fits.

use crate::file::{FileId, PagedFiles};
use crate::slotted;
use bytes::Bytes;
use shale_common::page::PAGE_SIZE;
use shale_common::{Result, RecordId, ShaleError};
use std::path::Path;
use std::sync::Arc;

/// Space usage report for a record file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpaceStats {
    /// Number of data pages.
    pub total_pages: u32,
    /// Number of live records.
    pub num_records: u64,
    /// Total bytes across all data pages.
    pub total_bytes: u64,
    /// Sum of live record lengths.
    pub used_bytes: u64,
    /// Bytes spent on slot directory entries, tombstones included.
    pub slot_overhead: u64,
    /// Bytes spent on page headers.
    pub header_overhead: u64,
    /// Contiguous free space across all pages, usable by inserts.
    pub free_bytes: u64,
    /// Dead bytes left in record areas by deletions; reclaimed only by
    /// compaction.
    pub fragmented_bytes: u64,
}

impl SpaceStats {
    /// Fraction of total bytes holding live record data.
    pub fn utilization(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// A file of variable-length records stored on slotted pages.
pub struct RecordFile {
    files: Arc<PagedFiles>,
    fd: FileId,
}

impl RecordFile {
    /// Creates a new, empty record file on disk.
    pub fn create(files: &PagedFiles, path: &Path) -> Result<()> {
        files.create(path)
    }

    /// Opens an existing record file.
    pub fn open(files: Arc<PagedFiles>, path: &Path) -> Result<Self> {
        let fd = files.open(path)?;
        Ok(Self { files, fd })
    }

    /// Returns the underlying file handle.
    pub fn fd(&self) -> FileId {
        self.fd
    }

    /// Closes the record file, flushing dirty pages.
    pub fn close(self) -> Result<()> {
        self.files.close(self.fd)
    }

    /// Returns the number of data pages.
    pub fn num_pages(&self) -> Result<u32> {
        self.files.num_pages(self.fd)
    }

    /// Inserts a record, returning its RecordId.
    ///
    /// Existing pages are tried in order; the first page with room takes
    /// the record. When none fits, a fresh page is appended. Records
    /// larger than a page can hold are rejected with `NoSpace`.
    pub fn insert(&self, record: &[u8]) -> Result<RecordId> {
        if record.len() > slotted::MAX_RECORD_SIZE {
            return Err(ShaleError::NoSpace {
                needed: record.len(),
                available: slotted::MAX_RECORD_SIZE,
            });
        }

        let num_pages = self.files.num_pages(self.fd)?;
        for page_num in 0..num_pages {
            let frame = self.files.get_page(self.fd, page_num)?;
            let inserted = {
                let mut data = frame.write_data();
                slotted::insert(&mut data[..], record)
            };
            match inserted {
                Ok(slot) => {
                    self.files.unpin(self.fd, page_num, true)?;
                    return Ok(RecordId::new(page_num, slot));
                }
                Err(ShaleError::NoSpace { .. }) => {
                    self.files.unpin(self.fd, page_num, false)?;
                }
                Err(e) => {
                    self.files.unpin(self.fd, page_num, false)?;
                    return Err(e);
                }
            }
        }

        // Nothing fit; append a fresh page.
        let (page_num, frame) = self.files.alloc_page(self.fd)?;
        let slot = {
            let mut data = frame.write_data();
            slotted::init(&mut data[..], page_num as i32);
            slotted::insert(&mut data[..], record)
        };
        match slot {
            Ok(slot) => {
                self.files.unpin(self.fd, page_num, true)?;
                Ok(RecordId::new(page_num, slot))
            }
            Err(e) => {
                self.files.unpin(self.fd, page_num, true)?;
                Err(e)
            }
        }
    }

    /// Fetches a record's bytes.
    pub fn get(&self, rid: RecordId) -> Result<Bytes> {
        let frame = self.files.get_page(self.fd, rid.page_num)?;
        let result = {
            let data = frame.read_data();
            slotted::get(&data[..], rid.slot).map(Bytes::copy_from_slice)
        };
        self.files.unpin(self.fd, rid.page_num, false)?;
        result
    }

    /// Deletes a record, tombstoning its slot.
    pub fn delete(&self, rid: RecordId) -> Result<()> {
        let frame = self.files.get_page(self.fd, rid.page_num)?;
        let result = {
            let mut data = frame.write_data();
            slotted::delete(&mut data[..], rid.slot)
        };
        self.files.unpin(self.fd, rid.page_num, result.is_ok())?;
        result
    }

    /// Compacts one page, removing its tombstones.
    ///
    /// Slot numbers on the page change; the caller must not hold any
    /// RecordId pointing into it.
    pub fn compact_page(&self, page_num: u32) -> Result<()> {
        let frame = self.files.get_page(self.fd, page_num)?;
        {
            let mut data = frame.write_data();
            slotted::compact(&mut data[..]);
        }
        self.files.unpin(self.fd, page_num, true)
    }

    /// Scans every live record in page order, slot order within a page.
    pub fn scan(&self) -> Result<Vec<(RecordId, Bytes)>> {
        let num_pages = self.files.num_pages(self.fd)?;
        let mut results = Vec::new();

        for page_num in 0..num_pages {
            let frame = self.files.get_page(self.fd, page_num)?;
            {
                let data = frame.read_data();
                for slot_num in 0..slotted::num_slots(&data[..]) {
                    if let Ok(record) = slotted::get(&data[..], slot_num) {
                        results.push((
                            RecordId::new(page_num, slot_num),
                            Bytes::copy_from_slice(record),
                        ));
                    }
                }
            }
            self.files.unpin(self.fd, page_num, false)?;
        }

        Ok(results)
    }

    /// Gathers the space usage report across all pages.
    pub fn space_stats(&self) -> Result<SpaceStats> {
        let num_pages = self.files.num_pages(self.fd)?;
        let mut stats = SpaceStats {
            total_pages: num_pages,
            total_bytes: num_pages as u64 * PAGE_SIZE as u64,
            header_overhead: num_pages as u64 * slotted::HEADER_SIZE as u64,
            ..Default::default()
        };

        for page_num in 0..num_pages {
            let frame = self.files.get_page(self.fd, page_num)?;
            {
                let data = frame.read_data();
                let hdr = slotted::header(&data[..]);
                stats.slot_overhead += hdr.num_slots as u64 * slotted::SLOT_SIZE as u64;

                // free_space_size counts freed record bytes that are not
                // contiguously usable; the difference is fragmentation.
                let dir_end = slotted::HEADER_SIZE as u64
                    + hdr.num_slots as u64 * slotted::SLOT_SIZE as u64;
                let contiguous = (hdr.free_space_offset as u64).saturating_sub(dir_end);
                stats.free_bytes += contiguous;
                stats.fragmented_bytes += (hdr.free_space_size as u64).saturating_sub(contiguous);

                for slot_num in 0..hdr.num_slots {
                    if let Some(entry) = slotted::slot(&data[..], slot_num) {
                        if !entry.is_tombstone() {
                            stats.num_records += 1;
                            stats.used_bytes += entry.length as u64;
                        }
                    }
                }
            }
            self.files.unpin(self.fd, page_num, false)?;
        }

        debug_assert_eq!(
            stats.total_bytes,
            stats.used_bytes
                + stats.slot_overhead
                + stats.header_overhead
                + stats.free_bytes
                + stats.fragmented_bytes
        );
        Ok(stats)
    }
}
