//! B+ tree index file: metadata page, insertion primitive, lookup.

use super::page::{
    internal_capacity, leaf_capacity, InternalPage, InternalPageMut, LeafPage, LeafPageMut,
    META_MARKER, NO_NEXT_LEAF,
};
use super::KeyType;
use crate::file::{FileId, PagedFiles};
use bytes::Bytes;
use parking_lot::Mutex;
use shale_common::{RecordId, Result, ShaleError};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Data page holding the index metadata.
const META_PAGE: u32 = 0;

/// Root sentinel of an empty index.
const NO_ROOT: i32 = -1;

/// Index metadata, cached in memory and written to data page 0.
///
/// On-disk layout: marker 'H', key_type u8, key_len u16, root_page i32,
/// height u16, num_entries u64.
#[derive(Debug, Clone, Copy)]
pub struct IndexMeta {
    /// Type of the indexed attribute.
    pub key_type: KeyType,
    /// Fixed key width in bytes.
    pub key_len: u16,
    /// Root page number, -1 while the index is empty.
    pub root_page: i32,
    /// Tree height; 1 means the root is a leaf, 0 means empty.
    pub height: u16,
    /// Number of entries in the index.
    pub num_entries: u64,
}

impl IndexMeta {
    fn write_to(self, data: &mut [u8]) {
        data[0] = META_MARKER;
        data[1] = self.key_type.as_u8();
        data[2..4].copy_from_slice(&self.key_len.to_le_bytes());
        data[4..8].copy_from_slice(&self.root_page.to_le_bytes());
        data[8..10].copy_from_slice(&self.height.to_le_bytes());
        data[10..18].copy_from_slice(&self.num_entries.to_le_bytes());
    }

    fn read_from(data: &[u8]) -> Result<Self> {
        if data[0] != META_MARKER {
            return Err(ShaleError::IndexCorrupted(format!(
                "expected meta marker, found 0x{:02x}",
                data[0]
            )));
        }
        let key_type = KeyType::from_u8(data[1]).ok_or_else(|| {
            ShaleError::IndexCorrupted(format!("unknown key type {}", data[1]))
        })?;
        Ok(Self {
            key_type,
            key_len: u16::from_le_bytes([data[2], data[3]]),
            root_page: i32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            height: u16::from_le_bytes([data[8], data[9]]),
            num_entries: u64::from_le_bytes([
                data[10], data[11], data[12], data[13], data[14], data[15], data[16], data[17],
            ]),
        })
    }
}

/// Builds the on-disk path of index `index_no` of `name`.
pub fn index_file_path(name: &Path, index_no: u32) -> PathBuf {
    let mut os = name.as_os_str().to_os_string();
    os.push(format!(".{index_no}"));
    PathBuf::from(os)
}

/// Creates an empty index file with its metadata page.
pub fn create_index(
    files: &Arc<PagedFiles>,
    name: &Path,
    index_no: u32,
    key_type: KeyType,
    key_len: u16,
) -> Result<()> {
    if key_len == 0
        || leaf_capacity(key_len as usize) < 2
        || internal_capacity(key_len as usize) < 2
    {
        return Err(ShaleError::Config(format!(
            "unusable index key length {key_len}"
        )));
    }
    if matches!(key_type, KeyType::Int | KeyType::Float) && key_len < 4 {
        return Err(ShaleError::Config(format!(
            "{key_type:?} keys need at least 4 bytes, got {key_len}"
        )));
    }

    let path = index_file_path(name, index_no);
    files.create(&path)?;

    let meta = IndexMeta {
        key_type,
        key_len,
        root_page: NO_ROOT,
        height: 0,
        num_entries: 0,
    };
    let result = (|| {
        let fd = files.open(&path)?;
        let written = (|| {
            let (page_num, frame) = files.alloc_page(fd)?;
            debug_assert_eq!(page_num, META_PAGE);
            meta.write_to(&mut frame.write_data()[..]);
            files.unpin(fd, page_num, true)
        })();
        written.and(files.close(fd))
    })();

    if result.is_err() {
        let _ = files.destroy(&path);
    }
    result
}

/// Removes an index file from disk.
pub fn destroy_index(files: &PagedFiles, name: &Path, index_no: u32) -> Result<()> {
    files.destroy(&index_file_path(name, index_no))
}

/// An open B+ tree index.
pub struct Index {
    files: Arc<PagedFiles>,
    fd: FileId,
    meta: Mutex<IndexMeta>,
}

impl Index {
    /// Opens an existing index.
    pub fn open(files: Arc<PagedFiles>, name: &Path, index_no: u32) -> Result<Self> {
        let fd = files.open(&index_file_path(name, index_no))?;
        let index = Self {
            files,
            fd,
            meta: Mutex::new(IndexMeta {
                key_type: KeyType::Char,
                key_len: 0,
                root_page: NO_ROOT,
                height: 0,
                num_entries: 0,
            }),
        };
        let meta = index.with_page(META_PAGE, |data| IndexMeta::read_from(data))?;
        *index.meta.lock() = meta;
        Ok(index)
    }

    /// Closes the index, writing the metadata page back.
    pub fn close(self) -> Result<()> {
        self.sync_meta()?;
        self.files.close(self.fd)
    }

    /// Returns a snapshot of the index metadata.
    pub fn meta(&self) -> IndexMeta {
        *self.meta.lock()
    }

    /// Returns the underlying file handle.
    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub(crate) fn update_meta(&self, f: impl FnOnce(&mut IndexMeta)) {
        f(&mut self.meta.lock());
    }

    /// Writes the cached metadata to data page 0.
    pub fn sync_meta(&self) -> Result<()> {
        let meta = *self.meta.lock();
        self.with_page_mut(META_PAGE, |data| {
            meta.write_to(data);
            Ok(())
        })
    }

    /// Runs a read closure against a pinned page, unpinning afterwards.
    fn with_page<T>(&self, page: u32, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        let frame = self.files.get_page(self.fd, page)?;
        let result = {
            let data = frame.read_data();
            f(&data[..])
        };
        let unpin = self.files.unpin(self.fd, page, false);
        result.and_then(|value| unpin.map(|_| value))
    }

    /// Runs a write closure against a pinned page, unpinning dirty on
    /// success and clean on failure.
    fn with_page_mut<T>(&self, page: u32, f: impl FnOnce(&mut [u8]) -> Result<T>) -> Result<T> {
        let frame = self.files.get_page(self.fd, page)?;
        let result = {
            let mut data = frame.write_data();
            f(&mut data[..])
        };
        let unpin = self.files.unpin(self.fd, page, result.is_ok());
        result.and_then(|value| unpin.map(|_| value))
    }

    /// Allocates a page, formats it through the closure (which receives
    /// the new page number), and unpins dirty.
    pub(crate) fn alloc_with<T>(
        &self,
        f: impl FnOnce(u32, &mut [u8]) -> Result<T>,
    ) -> Result<(u32, T)> {
        let (page_num, frame) = self.files.alloc_page(self.fd)?;
        let result = {
            let mut data = frame.write_data();
            f(page_num, &mut data[..])
        };
        let unpin = self.files.unpin(self.fd, page_num, true);
        match result {
            Ok(value) => unpin.map(|_| (page_num, value)),
            Err(e) => Err(e),
        }
    }

    /// Descends from the root, returning the internal path and the leaf.
    fn descend(&self, meta: &IndexMeta, key: &[u8]) -> Result<(Vec<u32>, u32)> {
        let mut path = Vec::with_capacity(meta.height as usize);
        let mut current = meta.root_page as u32;
        for _ in 1..meta.height {
            path.push(current);
            current = self.with_page(current, |data| {
                Ok(InternalPage::read(data)?.find_child(key, meta.key_type))
            })?;
        }
        Ok((path, current))
    }

    /// Inserts one `(key, RecordId)` entry.
    ///
    /// Navigates from the root and splits leaves and internal nodes as
    /// needed, growing a new root when the split reaches it.
    pub fn insert_entry(&self, key: &[u8], rid: RecordId) -> Result<()> {
        let mut meta = self.meta.lock();
        if key.len() != meta.key_len as usize {
            return Err(ShaleError::KeyLengthMismatch {
                expected: meta.key_len,
                actual: key.len(),
            });
        }

        if meta.root_page == NO_ROOT {
            let key_len = meta.key_len;
            let (page_num, ()) = self.alloc_with(|_, data| {
                let mut leaf = LeafPageMut::init(
                    data,
                    key_len,
                    leaf_capacity(key_len as usize) as u16,
                    NO_NEXT_LEAF,
                );
                leaf.push(key, rid);
                Ok(())
            })?;
            meta.root_page = page_num as i32;
            meta.height = 1;
            meta.num_entries += 1;
            return Ok(());
        }

        let (path, leaf_page) = self.descend(&meta, key)?;

        let key_type = meta.key_type;
        let capacity = leaf_capacity(meta.key_len as usize);
        let inserted = self.with_page_mut(leaf_page, |data| {
            let mut leaf = LeafPageMut::open(data)?;
            if leaf.as_ref().key_count() < capacity {
                let (pos, _) = leaf.as_ref().search(key, key_type);
                leaf.insert_at(pos, key, rid);
                Ok(true)
            } else {
                Ok(false)
            }
        })?;

        if !inserted {
            self.split_leaf_insert(&mut meta, &path, leaf_page, key, rid)?;
        }
        meta.num_entries += 1;
        Ok(())
    }

    /// Splits a full leaf, inserting the new entry on the proper side, and
    /// propagates the separator upward.
    fn split_leaf_insert(
        &self,
        meta: &mut IndexMeta,
        path: &[u32],
        leaf_page: u32,
        key: &[u8],
        rid: RecordId,
    ) -> Result<()> {
        let key_type = meta.key_type;
        let key_len = meta.key_len;

        let (mut entries, old_next) = self.with_page(leaf_page, |data| {
            let leaf = LeafPage::read(data)?;
            let mut v: Vec<(Bytes, RecordId)> = Vec::with_capacity(leaf.key_count() + 1);
            for i in 0..leaf.key_count() {
                v.push((Bytes::copy_from_slice(leaf.key(i)), leaf.rec_id(i)));
            }
            Ok((v, leaf.next_leaf()))
        })?;

        let pos = entries
            .partition_point(|(k, _)| key_type.compare(k, key) == Ordering::Less);
        entries.insert(pos, (Bytes::copy_from_slice(key), rid));

        let mid = entries.len() / 2;
        let separator = entries[mid].0.clone();

        let (new_page, ()) = self.alloc_with(|_, data| {
            let mut right = LeafPageMut::init(
                data,
                key_len,
                leaf_capacity(key_len as usize) as u16,
                old_next,
            );
            right.set_entries(&entries[mid..]);
            Ok(())
        })?;

        self.with_page_mut(leaf_page, |data| {
            let mut left = LeafPageMut::open(data)?;
            left.set_entries(&entries[..mid]);
            left.set_next_leaf(new_page as i32);
            Ok(())
        })?;

        self.insert_into_parent(meta, path, separator, new_page)
    }

    /// Inserts a separator into the parent chain, splitting internal nodes
    /// as needed and growing a new root when the path is exhausted.
    fn insert_into_parent(
        &self,
        meta: &mut IndexMeta,
        path: &[u32],
        mut key: Bytes,
        mut right_child: u32,
    ) -> Result<()> {
        let key_type = meta.key_type;
        let key_len = meta.key_len;
        let capacity = internal_capacity(key_len as usize);
        let mut idx = path.len();

        loop {
            if idx == 0 {
                let old_root = meta.root_page as u32;
                let (page_num, ()) = self.alloc_with(|_, data| {
                    let mut root =
                        InternalPageMut::init(data, key_len, capacity as u16, old_root);
                    root.push(&key, right_child);
                    Ok(())
                })?;
                meta.root_page = page_num as i32;
                meta.height += 1;
                debug!(root = page_num, height = meta.height, "index root grew");
                return Ok(());
            }
            idx -= 1;
            let parent_page = path[idx];

            let inserted = self.with_page_mut(parent_page, |data| {
                let mut node = InternalPageMut::open(data)?;
                let count = node.as_ref().key_count();
                if count < capacity {
                    let pos = {
                        let view = node.as_ref();
                        let mut p = 0;
                        while p < count
                            && key_type.compare(view.key(p), &key) == Ordering::Less
                        {
                            p += 1;
                        }
                        p
                    };
                    node.insert_at(pos, &key, right_child);
                    Ok(true)
                } else {
                    Ok(false)
                }
            })?;
            if inserted {
                return Ok(());
            }

            // Split the full internal node.
            let (mut entries, left_edge) = self.with_page(parent_page, |data| {
                let node = InternalPage::read(data)?;
                let mut v: Vec<(Bytes, u32)> = Vec::with_capacity(node.key_count() + 1);
                for i in 0..node.key_count() {
                    v.push((Bytes::copy_from_slice(node.key(i)), node.child(i)));
                }
                Ok((v, node.left_child()))
            })?;

            let pos = entries
                .partition_point(|(k, _)| key_type.compare(k, &key) == Ordering::Less);
            entries.insert(pos, (key.clone(), right_child));

            let mid = entries.len() / 2;
            let promoted = entries[mid].0.clone();
            let right_left_edge = entries[mid].1;

            let (new_page, ()) = self.alloc_with(|_, data| {
                let mut right =
                    InternalPageMut::init(data, key_len, capacity as u16, right_left_edge);
                right.set_entries(&entries[mid + 1..]);
                Ok(())
            })?;

            self.with_page_mut(parent_page, |data| {
                let mut node = InternalPageMut::open(data)?;
                node.set_left_child(left_edge);
                node.set_entries(&entries[..mid]);
                Ok(())
            })?;

            key = promoted;
            right_child = new_page;
        }
    }

    /// Probes the index for a key.
    ///
    /// A verification aid for the construction strategies, not a query
    /// surface: returns the RecordId of the first matching entry.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<RecordId>> {
        let meta = *self.meta.lock();
        if key.len() != meta.key_len as usize {
            return Err(ShaleError::KeyLengthMismatch {
                expected: meta.key_len,
                actual: key.len(),
            });
        }
        if meta.root_page == NO_ROOT {
            return Ok(None);
        }

        let (_, leaf_page) = self.descend(&meta, key)?;
        self.with_page(leaf_page, |data| {
            let leaf = LeafPage::read(data)?;
            let (pos, found) = leaf.search(key, meta.key_type);
            Ok(found.then(|| leaf.rec_id(pos)))
        })
    }

    /// Walks the linked leaves left-to-right, yielding every entry.
    pub fn scan_entries(&self) -> Result<Vec<(Bytes, RecordId)>> {
        let meta = *self.meta.lock();
        if meta.root_page == NO_ROOT {
            return Ok(Vec::new());
        }

        // Find the leftmost leaf.
        let mut current = meta.root_page as u32;
        for _ in 1..meta.height {
            current = self.with_page(current, |data| {
                Ok(InternalPage::read(data)?.left_child())
            })?;
        }

        let mut entries = Vec::with_capacity(meta.num_entries as usize);
        let mut page = current as i32;
        while page != NO_NEXT_LEAF {
            page = self.with_page(page as u32, |data| {
                let leaf = LeafPage::read(data)?;
                for i in 0..leaf.key_count() {
                    entries.push((Bytes::copy_from_slice(leaf.key(i)), leaf.rec_id(i)));
                }
                Ok(leaf.next_leaf())
            })?;
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shale_buffer::{BufferPool, BufferPoolConfig};
    use tempfile::tempdir;

    const KEY_LEN: u16 = 20;

    fn test_files(num_frames: usize) -> (Arc<PagedFiles>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pool = Arc::new(
            BufferPool::new(BufferPoolConfig {
                num_frames,
                ..Default::default()
            })
            .unwrap(),
        );
        (Arc::new(PagedFiles::new(pool, false)), dir)
    }

    fn key(i: u32) -> Vec<u8> {
        let mut k = format!("K{i:08}").into_bytes();
        k.resize(KEY_LEN as usize, 0);
        k
    }

    #[test]
    fn test_create_and_open_empty() {
        let (files, dir) = test_files(8);
        let name = dir.path().join("students");

        create_index(&files, &name, 0, KeyType::Char, KEY_LEN).unwrap();
        let index = Index::open(files.clone(), &name, 0).unwrap();

        let meta = index.meta();
        assert_eq!(meta.key_len, KEY_LEN);
        assert_eq!(meta.root_page, -1);
        assert_eq!(meta.height, 0);
        assert_eq!(meta.num_entries, 0);
        assert_eq!(index.lookup(&key(1)).unwrap(), None);

        index.close().unwrap();
        destroy_index(&files, &name, 0).unwrap();
    }

    #[test]
    fn test_create_rejects_unusable_key_len() {
        let (files, dir) = test_files(8);
        let name = dir.path().join("bad");
        assert!(matches!(
            create_index(&files, &name, 0, KeyType::Char, 0),
            Err(ShaleError::Config(_))
        ));
    }

    #[test]
    fn test_single_insert_makes_root_leaf() {
        let (files, dir) = test_files(8);
        let name = dir.path().join("ix");
        create_index(&files, &name, 0, KeyType::Char, KEY_LEN).unwrap();
        let index = Index::open(files, &name, 0).unwrap();

        index.insert_entry(&key(7), RecordId::new(0, 0)).unwrap();

        let meta = index.meta();
        assert_eq!(meta.height, 1);
        assert_eq!(meta.num_entries, 1);
        assert_eq!(
            index.lookup(&key(7)).unwrap(),
            Some(RecordId::new(0, 0))
        );
        index.close().unwrap();
    }

    #[test]
    fn test_insert_key_length_checked() {
        let (files, dir) = test_files(8);
        let name = dir.path().join("ix");
        create_index(&files, &name, 0, KeyType::Char, KEY_LEN).unwrap();
        let index = Index::open(files, &name, 0).unwrap();

        assert!(matches!(
            index.insert_entry(b"short", RecordId::new(0, 0)),
            Err(ShaleError::KeyLengthMismatch { .. })
        ));
        index.close().unwrap();
    }

    #[test]
    fn test_inserts_split_and_stay_sorted() {
        let (files, dir) = test_files(16);
        let name = dir.path().join("ix");
        create_index(&files, &name, 0, KeyType::Char, KEY_LEN).unwrap();
        let index = Index::open(files, &name, 0).unwrap();

        // Enough entries to force several leaf splits and a root split.
        let n = 1000u32;
        for i in (0..n).rev() {
            index
                .insert_entry(&key(i), RecordId::new(i, 0))
                .unwrap();
        }

        let meta = index.meta();
        assert!(meta.height >= 2);
        assert_eq!(meta.num_entries, n as u64);

        let entries = index.scan_entries().unwrap();
        assert_eq!(entries.len(), n as usize);
        for window in entries.windows(2) {
            assert!(window[0].0 <= window[1].0);
        }

        for i in 0..n {
            assert_eq!(
                index.lookup(&key(i)).unwrap(),
                Some(RecordId::new(i, 0)),
                "key {i} lost"
            );
        }
        index.close().unwrap();
    }

    #[test]
    fn test_meta_survives_reopen() {
        let (files, dir) = test_files(8);
        let name = dir.path().join("ix");
        create_index(&files, &name, 0, KeyType::Char, KEY_LEN).unwrap();

        {
            let index = Index::open(files.clone(), &name, 0).unwrap();
            for i in 0..100 {
                index.insert_entry(&key(i), RecordId::new(i, 0)).unwrap();
            }
            index.close().unwrap();
        }

        let index = Index::open(files, &name, 0).unwrap();
        let meta = index.meta();
        assert_eq!(meta.num_entries, 100);
        assert_eq!(
            index.lookup(&key(42)).unwrap(),
            Some(RecordId::new(42, 0))
        );
        index.close().unwrap();
    }
}
