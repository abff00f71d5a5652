//! Storage engine for ShaleDB.
//!
//! This crate provides:
//! - Paged file store with header page and disposed-page chain
//! - Slotted page codec for variable-length records
//! - Record files with first-fit insert and full scans
//! - B+ tree index construction (insertion-driven and bulk load)

pub mod file;
pub mod index;
pub mod record;
pub mod slotted;

pub use file::{FileId, PagedFiles, MAX_OPEN_FILES};
pub use index::{
    build_bulk_load, build_from_existing, build_incremental, create_index, destroy_index, Index,
    IndexMeta, KeyType, DEFAULT_FILL_FACTOR,
};
pub use record::{RecordFile, SpaceStats};

use shale_buffer::{BufferPool, BufferPoolConfig};
use shale_common::{Result, StorageConfig};
use std::sync::Arc;

/// Builds the storage stack a [`StorageConfig`] describes: a buffer pool
/// with the configured frame count and replacement policy, and a paged
/// file store on top of it. Ensures the data directory exists.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<PagedFiles>> {
    config.validate()?;
    std::fs::create_dir_all(&config.data_dir)?;
    let pool = Arc::new(BufferPool::new(BufferPoolConfig {
        num_frames: config.pool_frames,
        policy: config.policy,
    })?);
    Ok(Arc::new(PagedFiles::new(pool, config.fsync_enabled)))
}
