//! Buffer pool management for ShaleDB.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size frame pool with pin/unpin discipline
//! - Hash page directory for O(1) page lookup
//! - Selectable LRU/MRU replacement over a recency list
//! - Dirty page tracking with write-back on eviction
//! - Exhaustive logical/physical I/O accounting

mod frame;
mod page_table;
mod pool;
mod replacer;

pub use frame::{BufferFrame, FrameId};
pub use page_table::PageTable;
pub use pool::{BufferPool, BufferPoolConfig, BufferStats, PageIo};
pub use replacer::RecencyList;
