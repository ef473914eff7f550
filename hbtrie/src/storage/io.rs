//! Block store abstraction.
//!
//! This module provides the `BlockStore` trait: the operation table the
//! block group uses to reach durable storage. A file-backed store is used
//! in production and an in-memory store with fault injection in tests.
//!
//! # Design
//!
//! The trait is a minimal abstraction over:
//! - Block read/write operations
//! - Growing and shrinking the store
//! - Synchronization
//! - Superblock slot management
//!
//! Nothing above this trait knows whether blocks live in a file or in memory,
//! which lets tests inject faults and simulate crashes at the block level.

use crate::storage::page::{Page, PageId};
use crate::storage::superblock::Superblock;

/// Errors that can occur during block store operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Block out of bounds.
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
    /// Superblock error.
    Superblock(String),
    /// Injected fault for simulation.
    InjectedFault(String),
    /// Corruption detected.
    Corruption(String),
    /// A new operation was started while blocks from another one were still staged.
    OperationInFlight,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => write!(
                f,
                "page {page_id} out of bounds (total pages: {total_pages})"
            ),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::OperationInFlight => write!(f, "block group has staged blocks in flight"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over block-based durable storage.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_block` returns the last written content for a block
/// - `sync` makes all previous writes (blocks and superblock) durable
/// - `allocate_blocks` extends the store and `truncate` shrinks it
/// - `write_superblock` writes the slot selected by `Superblock::slot`
pub trait BlockStore {
    /// Read a block.
    fn read_block(&mut self, page_id: PageId) -> Result<Page, StorageError>;

    /// Write a block. The write may be buffered until `sync` is called.
    fn write_block(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError>;

    /// Grow the store by `count` blocks, returning the first new block id.
    fn allocate_blocks(&mut self, count: u64) -> Result<PageId, StorageError>;

    /// Shrink (or grow) the store to exactly `total_pages` blocks.
    fn truncate(&mut self, total_pages: u64) -> Result<(), StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&mut self) -> Result<(), StorageError>;

    /// Get the total number of blocks in the store, superblock slots included.
    fn total_blocks(&self) -> u64;

    /// Get the most recently written superblock.
    fn superblock(&self) -> &Superblock;

    /// Write a new superblock into its slot.
    ///
    /// The write may be buffered until `sync` is called.
    fn write_superblock(&mut self, superblock: Superblock) -> Result<(), StorageError>;
}
