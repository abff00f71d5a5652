//! Error types for ShaleDB.

use crate::page::PageId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using ShaleError.
pub type Result<T> = std::result::Result<T, ShaleError>;

/// Errors that can occur in ShaleDB operations.
///
/// Every layer returns these synchronously; no layer recovers on its own
/// or aborts the process.
#[derive(Debug, Error)]
pub enum ShaleError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("incomplete read of page {page}")]
    ShortRead { page: PageId },

    #[error("incomplete write of page {page}")]
    ShortWrite { page: PageId },

    #[error("incomplete read of file header: {0}")]
    HeaderRead(PathBuf),

    #[error("incomplete write of file header: {0}")]
    HeaderWrite(PathBuf),

    // Buffer pool errors
    #[error("no buffer space left, all frames are fixed")]
    NoBuffer,

    #[error("page {page} already fixed in buffer")]
    PageFixed { page: PageId },

    #[error("page {page} not in buffer")]
    PageNotInBuffer { page: PageId },

    #[error("page {page} already unfixed")]
    PageUnfixed { page: PageId },

    // Hash page directory errors
    #[error("page {page} already present in page directory")]
    HashDuplicate { page: PageId },

    #[error("page {page} not found in page directory")]
    HashNotFound { page: PageId },

    // Paged file errors
    #[error("invalid page number {page}")]
    InvalidPage { page: u32 },

    #[error("page {page} already free")]
    PageAlreadyFree { page: u32 },

    #[error("file already open: {0}")]
    FileOpen(PathBuf),

    #[error("file table full ({capacity} open files)")]
    FileTableFull { capacity: usize },

    #[error("invalid file handle: {handle}")]
    BadHandle { handle: u32 },

    // Slotted page errors
    #[error("invalid slot number {slot}")]
    InvalidSlot { slot: u16 },

    #[error("not enough space on page: need {needed}, have {available}")]
    NoSpace { needed: usize, available: usize },

    // Index errors
    #[error("key length mismatch: expected {expected}, got {actual}")]
    KeyLengthMismatch { expected: u16, actual: usize },

    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}
