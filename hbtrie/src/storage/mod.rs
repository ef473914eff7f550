//! Block storage for the trie.
//!
//! Everything below the trie lives here: fixed-size blocks, the stores that
//! hold them, the block group that stages and commits them, the B+tree built
//! on top of them, and the document log the trie's values point into.
//!
//! # File Format
//!
//! A store is a sequence of 4KB blocks:
//!
//! - Blocks 0-1: Superblock slots (the newest valid one wins)
//! - Remaining blocks: B+tree nodes of trie levels and leaf trees
//! - Past the data end, transiently: the commit journal
//!
//! # Usage
//!
//! ```no_run
//! use hbtrie::config::{StoreConfig, TrieConfig};
//! use hbtrie::storage::{BlockGroup, FileManager};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = FileManager::create(std::path::Path::new("index.hbt"))?;
//! let mut blocks = BlockGroup::open(file, &StoreConfig::default())?;
//!
//! // ... run trie operations against `blocks` ...
//!
//! blocks.commit(0, &TrieConfig::default())?;
//! # Ok(())
//! # }
//! ```

pub mod btree;
mod cache;
mod doclog;
mod file;
mod group;
mod io;
pub mod memory;
mod page;
mod superblock;

pub use cache::BlockCache;
pub use doclog::{DocLog, DocLogError, Document};
pub use file::{FileError, FileManager};
pub use group::{BlockGroup, CursorGuard, IDS_PER_INDEX_PAGE};
pub use io::{BlockStore, StorageError};
pub use memory::{FaultConfig, MemoryDisk, MemoryStore, MemoryStoreStats};
pub use page::{FIRST_DATA_PAGE, PAGE_SIZE, Page, PageError, PageHeader, PageId, PageType};
pub use superblock::{Superblock, SuperblockError};
