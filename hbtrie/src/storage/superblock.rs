//! Superblock structure and serialization.
//!
//! The superblock is stored twice, in pages 0 and 1. Each commit writes the
//! slot selected by the new sequence number, so a torn superblock write
//! always leaves the previous slot intact. On open the valid slot with the
//! highest sequence wins.

// PAGE_SIZE is a compile-time constant that fits in u32, and the trie
// parameters are bounded well below u32::MAX by `TrieConfig::validate`.
#![allow(clippy::cast_possible_truncation)]

use crate::config::TrieConfig;
use crate::storage::page::{PAGE_SIZE, Page, PageId};

/// Magic number identifying an HB+trie block file: "HBTRIEDB"
pub const MAGIC: [u8; 8] = *b"HBTRIEDB";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Number of superblock slots at the start of the store.
pub const SUPERBLOCK_SLOTS: u64 = 2;

/// Trie flag bit: meta-section compaction enabled.
pub const FLAG_COMPACT: u32 = 0x1;

/// Page size as u32 for storage in superblock.
const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

/// Superblock field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const SEQUENCE: usize = 16;
    pub const TOTAL_PAGE_COUNT: usize = 24;
    pub const TRIE_ROOT: usize = 32;
    pub const CHUNK_SIZE: usize = 40;
    pub const VALUE_SIZE: usize = 44;
    pub const TRIE_FLAGS: usize = 48;
    pub const LEAF_HEIGHT_LIMIT: usize = 52;
    pub const STALE_PAGES: usize = 56;
    pub const JOURNAL_START: usize = 64;
    pub const JOURNAL_COUNT: usize = 72;
    pub const CHECKSUM: usize = 80;
    // 84-4095: reserved
}

/// Metadata about the block store and the trie it holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes (should always be `PAGE_SIZE`).
    pub page_size: u32,
    /// Commit sequence number. Selects the slot this copy lives in.
    pub sequence: u64,
    /// Total number of pages in the store, superblock slots included.
    pub total_page_count: u64,
    /// Root page of trie level 0 (`0` when the trie is empty).
    pub trie_root: PageId,
    /// Chunk size the trie was built with (`0` before the first commit).
    pub chunk_size: u32,
    /// Value record size the trie was built with.
    pub value_size: u32,
    /// Trie flag bits (`FLAG_COMPACT`).
    pub trie_flags: u32,
    /// Leaf height limit the trie was built with.
    pub leaf_height_limit: u32,
    /// Pages released by collapses and tree rewrites, not reused.
    pub stale_pages: u64,
    /// First page of a pending commit journal.
    pub journal_start: PageId,
    /// Number of page images in the pending journal (`0` = none pending).
    pub journal_count: u64,
}

impl Superblock {
    /// Create a new superblock for an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: PAGE_SIZE_U32,
            sequence: 0,
            total_page_count: SUPERBLOCK_SLOTS,
            trie_root: 0,
            chunk_size: 0,
            value_size: 0,
            trie_flags: 0,
            leaf_height_limit: 0,
            stale_pages: 0,
            journal_start: 0,
            journal_count: 0,
        }
    }

    /// The page this copy of the superblock is written to.
    #[must_use]
    pub const fn slot(&self) -> PageId {
        self.sequence % SUPERBLOCK_SLOTS
    }

    /// Whether a commit journal must be replayed.
    #[must_use]
    pub const fn has_pending_journal(&self) -> bool {
        self.journal_count > 0
    }

    /// The trie configuration recorded by the last commit, if any.
    #[must_use]
    pub const fn trie_config(&self) -> Option<TrieConfig> {
        if self.chunk_size == 0 {
            return None;
        }
        Some(TrieConfig {
            chunk_size: self.chunk_size as usize,
            value_size: self.value_size as usize,
            compact: self.trie_flags & FLAG_COMPACT != 0,
            leaf_height_limit: self.leaf_height_limit as usize,
        })
    }

    /// Record the trie configuration.
    pub const fn set_trie_config(&mut self, config: &TrieConfig) {
        self.chunk_size = config.chunk_size as u32;
        self.value_size = config.value_size as u32;
        self.trie_flags = if config.compact { FLAG_COMPACT } else { 0 };
        self.leaf_height_limit = config.leaf_height_limit as u32;
    }

    /// Serialize the superblock to a page.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let mut page = Page::new();

        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size);
        page.write_u64(offsets::SEQUENCE, self.sequence);
        page.write_u64(offsets::TOTAL_PAGE_COUNT, self.total_page_count);
        page.write_u64(offsets::TRIE_ROOT, self.trie_root);
        page.write_u32(offsets::CHUNK_SIZE, self.chunk_size);
        page.write_u32(offsets::VALUE_SIZE, self.value_size);
        page.write_u32(offsets::TRIE_FLAGS, self.trie_flags);
        page.write_u32(offsets::LEAF_HEIGHT_LIMIT, self.leaf_height_limit);
        page.write_u64(offsets::STALE_PAGES, self.stale_pages);
        page.write_u64(offsets::JOURNAL_START, self.journal_start);
        page.write_u64(offsets::JOURNAL_COUNT, self.journal_count);

        let checksum = crc32fast::hash(page.read_bytes(0, offsets::CHECKSUM));
        page.write_u32(offsets::CHECKSUM, checksum);

        page
    }

    /// Deserialize a superblock from a page.
    pub fn from_page(page: &Page) -> Result<Self, SuperblockError> {
        // Validate magic number
        let mut magic = [0u8; 8];
        magic.copy_from_slice(page.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        let stored = page.read_u32(offsets::CHECKSUM);
        let computed = crc32fast::hash(page.read_bytes(0, offsets::CHECKSUM));
        if stored != computed {
            return Err(SuperblockError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size != PAGE_SIZE_U32 {
            return Err(SuperblockError::InvalidPageSize(page_size));
        }

        Ok(Self {
            format_version,
            page_size,
            sequence: page.read_u64(offsets::SEQUENCE),
            total_page_count: page.read_u64(offsets::TOTAL_PAGE_COUNT),
            trie_root: page.read_u64(offsets::TRIE_ROOT),
            chunk_size: page.read_u32(offsets::CHUNK_SIZE),
            value_size: page.read_u32(offsets::VALUE_SIZE),
            trie_flags: page.read_u32(offsets::TRIE_FLAGS),
            leaf_height_limit: page.read_u32(offsets::LEAF_HEIGHT_LIMIT),
            stale_pages: page.read_u64(offsets::STALE_PAGES),
            journal_start: page.read_u64(offsets::JOURNAL_START),
            journal_count: page.read_u64(offsets::JOURNAL_COUNT),
        })
    }

    /// Pick the newest valid superblock out of the two slots.
    pub fn select(slot0: &Page, slot1: &Page) -> Result<Self, SuperblockError> {
        match (Self::from_page(slot0), Self::from_page(slot1)) {
            (Ok(a), Ok(b)) => Ok(if b.sequence > a.sequence { b } else { a }),
            (Ok(sb), Err(_)) | (Err(_), Ok(sb)) => Ok(sb),
            (Err(e), Err(_)) => Err(e),
        }
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur when reading a superblock.
#[derive(Debug)]
pub enum SuperblockError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Invalid page size.
    InvalidPageSize(u32),
    /// Torn or corrupted superblock slot.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "superblock checksum mismatch: expected {expected}, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for SuperblockError {}
