//! File-backed block store.
//!
//! This module handles reading and writing blocks to a single store file.
//! Pages 0 and 1 are the superblock slots; everything after is trie data
//! and, transiently during a commit, the commit journal.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::storage::io::{BlockStore, StorageError};
use crate::storage::page::{PAGE_SIZE, PAGE_SIZE_U64, Page, PageId};
use crate::storage::superblock::{SUPERBLOCK_SLOTS, Superblock, SuperblockError};

/// A store file handle with low-level block I/O operations.
pub struct FileManager {
    file: File,
    superblock: Superblock,
    total_pages: u64,
}

impl FileManager {
    /// Create a new store file at the given path.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        // Slot 0 holds a fresh superblock, slot 1 stays blank until the first commit
        let superblock = Superblock::new();
        file.write_all(superblock.to_page().as_bytes())
            .map_err(FileError::Io)?;
        file.write_all(Page::new().as_bytes())
            .map_err(FileError::Io)?;
        file.sync_all().map_err(FileError::Io)?;

        Ok(Self {
            file,
            superblock,
            total_pages: SUPERBLOCK_SLOTS,
        })
    }

    /// Open an existing store file.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        let file_len = file.metadata().map_err(FileError::Io)?.len();
        let total_pages = file_len / PAGE_SIZE_U64;
        if total_pages < SUPERBLOCK_SLOTS {
            return Err(FileError::Truncated(file_len));
        }

        let mut slots = [Page::new(), Page::new()];
        for slot in &mut slots {
            file.read_exact(slot.as_bytes_mut()).map_err(FileError::Io)?;
        }
        let superblock =
            Superblock::select(&slots[0], &slots[1]).map_err(FileError::Superblock)?;

        Ok(Self {
            file,
            superblock,
            total_pages,
        })
    }

    /// Get a reference to the superblock.
    #[must_use]
    pub const fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Read a block from the file.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page, FileError> {
        self.check_bounds(page_id)?;

        let mut page = Page::new();
        self.file
            .seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))
            .map_err(FileError::Io)?;
        self.file
            .read_exact(page.as_bytes_mut())
            .map_err(FileError::Io)?;

        Ok(page)
    }

    /// Write a block to the file.
    pub fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), FileError> {
        self.check_bounds(page_id)?;

        self.file
            .seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))
            .map_err(FileError::Io)?;
        self.file
            .write_all(page.as_bytes())
            .map_err(FileError::Io)?;

        Ok(())
    }

    /// Write a superblock into the slot chosen by its sequence number.
    pub fn write_superblock(&mut self, superblock: Superblock) -> Result<(), FileError> {
        let page = superblock.to_page();

        self.file
            .seek(SeekFrom::Start(superblock.slot() * PAGE_SIZE_U64))
            .map_err(FileError::Io)?;
        self.file
            .write_all(page.as_bytes())
            .map_err(FileError::Io)?;

        self.superblock = superblock;
        Ok(())
    }

    /// Allocate new blocks at the end of the file.
    ///
    /// Returns the page ID of the first allocated block.
    pub fn allocate_pages(&mut self, count: u64) -> Result<PageId, FileError> {
        let first_new_page = self.total_pages;
        self.set_total(first_new_page + count)?;
        Ok(first_new_page)
    }

    /// Resize the file to exactly `total_pages` blocks.
    pub fn truncate(&mut self, total_pages: u64) -> Result<(), FileError> {
        self.set_total(total_pages.max(SUPERBLOCK_SLOTS))
    }

    /// Sync all pending writes to disk.
    pub fn sync(&self) -> Result<(), FileError> {
        self.file.sync_all().map_err(FileError::Io)
    }

    /// Get the total number of blocks in the file.
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    fn set_total(&mut self, total_pages: u64) -> Result<(), FileError> {
        self.file
            .set_len(total_pages * PAGE_SIZE_U64)
            .map_err(FileError::Io)?;
        self.total_pages = total_pages;
        Ok(())
    }

    const fn check_bounds(&self, page_id: PageId) -> Result<(), FileError> {
        if page_id >= self.total_pages {
            return Err(FileError::PageOutOfBounds {
                page_id,
                total_pages: self.total_pages,
            });
        }
        Ok(())
    }
}

/// Errors that can occur during file operations.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(std::path::PathBuf),
    /// File is shorter than the two superblock slots.
    Truncated(u64),
    /// Superblock error.
    Superblock(SuperblockError),
    /// Page ID out of bounds.
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::Truncated(len) => write!(
                f,
                "file too short: {len} bytes (need at least {})",
                PAGE_SIZE * 2
            ),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => {
                write!(
                    f,
                    "page {page_id} out of bounds (total pages: {total_pages})"
                )
            }
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::AlreadyExists(_) | Self::Truncated(_) | Self::PageOutOfBounds { .. } => None,
        }
    }
}

impl From<FileError> for StorageError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Io(io_err) => Self::Io(io_err),
            FileError::PageOutOfBounds {
                page_id,
                total_pages,
            } => Self::PageOutOfBounds {
                page_id,
                total_pages,
            },
            FileError::AlreadyExists(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", path.display()),
            )),
            FileError::Truncated(len) => Self::Corruption(format!("store file is {len} bytes")),
            FileError::Superblock(e) => Self::Superblock(e.to_string()),
        }
    }
}

impl BlockStore for FileManager {
    fn read_block(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        Self::read_page(self, page_id).map_err(StorageError::from)
    }

    fn write_block(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        Self::write_page(self, page_id, page).map_err(StorageError::from)
    }

    fn allocate_blocks(&mut self, count: u64) -> Result<PageId, StorageError> {
        Self::allocate_pages(self, count).map_err(StorageError::from)
    }

    fn truncate(&mut self, total_pages: u64) -> Result<(), StorageError> {
        Self::truncate(self, total_pages).map_err(StorageError::from)
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Self::sync(self).map_err(StorageError::from)
    }

    fn total_blocks(&self) -> u64 {
        Self::total_pages(self)
    }

    fn superblock(&self) -> &Superblock {
        Self::superblock(self)
    }

    fn write_superblock(&mut self, superblock: Superblock) -> Result<(), StorageError> {
        Self::write_superblock(self, superblock).map_err(StorageError::from)
    }
}
