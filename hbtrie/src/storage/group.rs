//! Block group: the caller-scoped handle every trie operation runs against.
//!
//! # Design
//!
//! Writes never reach the block store outside of `commit`:
//! - Blocks written during an operation are *staged*. `end` folds them into
//!   the pending set, `discard` drops them and rewinds allocation, so a
//!   failed operation leaves no trace.
//! - Pending blocks stay in memory until `commit`, which makes them durable
//!   through a redo journal:
//!   1. write a journal (index pages + block images) past the data end, sync
//!   2. write a superblock pointing at the journal, sync
//!   3. write every block in place, sync
//!   4. write a superblock without journal, sync, truncate the journal away
//! - `open` replays a journal left behind by a crash between 2 and 4.
//!
//! Freed blocks are counted as stale and never reused.
//!
//! # Invariants
//!
//! - Every staged or pending block id is in `FIRST_DATA_PAGE..next_page`
//! - Blocks in the cache are identical to their durable copy

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{StoreConfig, TrieConfig};
use crate::storage::cache::BlockCache;
use crate::storage::io::{BlockStore, StorageError};
use crate::storage::page::{FIRST_DATA_PAGE, PAGE_SIZE, Page, PageHeader, PageId, PageType};
use crate::storage::superblock::Superblock;

/// Offset of the id count inside a journal index page.
const JOURNAL_COUNT_OFFSET: usize = PageHeader::SIZE;

/// Offset of the first id inside a journal index page.
const JOURNAL_IDS_OFFSET: usize = JOURNAL_COUNT_OFFSET + 4;

/// Number of block ids one journal index page can list.
pub const IDS_PER_INDEX_PAGE: usize = (PAGE_SIZE - JOURNAL_IDS_OFFSET) / 8;

/// Tracks one open B+tree cursor. Dropping it releases the cursor.
#[derive(Debug)]
pub struct CursorGuard {
    open: Arc<AtomicUsize>,
}

impl CursorGuard {
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            open: Arc::clone(open),
        }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Block access for one trie, with per-operation staging and atomic commit.
pub struct BlockGroup {
    store: Box<dyn BlockStore>,
    cache: BlockCache,
    /// Blocks from completed operations, not yet durable.
    dirty: BTreeMap<PageId, Page>,
    /// Blocks written by the operation in flight.
    staged: BTreeMap<PageId, Page>,
    /// Blocks released by the operation in flight.
    staged_frees: Vec<PageId>,
    next_page: PageId,
    /// `next_page` when the operation in flight started.
    op_start_page: PageId,
    stale_pages: u64,
    open_cursors: Arc<AtomicUsize>,
}

impl BlockGroup {
    /// Open a block group over a store, replaying any pending commit journal.
    pub fn open<S: BlockStore + 'static>(
        store: S,
        config: &StoreConfig,
    ) -> Result<Self, StorageError> {
        let mut store: Box<dyn BlockStore> = Box::new(store);

        if store.superblock().has_pending_journal() {
            replay_journal(store.as_mut())?;
        }

        let superblock = *store.superblock();
        let data_end = superblock.total_page_count.max(FIRST_DATA_PAGE);

        // A crash while writing a journal leaves unreferenced blocks behind
        if store.total_blocks() > data_end {
            tracing::debug!(
                "dropping {} unreferenced blocks past page {data_end}",
                store.total_blocks() - data_end
            );
            store.truncate(data_end)?;
            store.sync()?;
        }

        Ok(Self {
            store,
            cache: BlockCache::new(config.cache_blocks),
            dirty: BTreeMap::new(),
            staged: BTreeMap::new(),
            staged_frees: Vec::new(),
            next_page: data_end,
            op_start_page: data_end,
            stale_pages: superblock.stale_pages,
            open_cursors: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The superblock of the last durable commit.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        self.store.superblock()
    }

    /// Read a block, seeing the writes of the operation in flight.
    pub fn read_block(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        if let Some(page) = self.staged.get(&page_id) {
            return Ok(page.clone());
        }
        if let Some(page) = self.dirty.get(&page_id) {
            return Ok(page.clone());
        }
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page.clone());
        }
        self.check_bounds(page_id)?;

        let page = self.store.read_block(page_id)?;
        if let Err(e) = page.verify() {
            tracing::warn!("block {page_id} failed verification: {e}");
            return Err(StorageError::Corruption(format!("block {page_id}: {e}")));
        }
        self.cache.insert(page_id, page.clone());
        Ok(page)
    }

    /// Stage a block write for the operation in flight.
    pub fn write_block(&mut self, page_id: PageId, page: Page) -> Result<(), StorageError> {
        self.check_bounds(page_id)?;
        self.staged.insert(page_id, page);
        Ok(())
    }

    /// Reserve a new block id. Rewound if the operation is discarded.
    pub const fn allocate_block(&mut self) -> PageId {
        let page_id = self.next_page;
        self.next_page += 1;
        page_id
    }

    /// Release a block once the operation in flight completes.
    pub fn free_block(&mut self, page_id: PageId) {
        self.staged_frees.push(page_id);
    }

    /// Complete the operation in flight.
    pub fn end(&mut self) {
        for (page_id, page) in std::mem::take(&mut self.staged) {
            self.cache.remove(page_id);
            self.dirty.insert(page_id, page);
        }
        for page_id in self.staged_frees.drain(..) {
            self.dirty.remove(&page_id);
            self.cache.remove(page_id);
            self.stale_pages += 1;
        }
        self.op_start_page = self.next_page;
    }

    /// Abandon the operation in flight.
    pub fn discard(&mut self) {
        if !self.staged.is_empty() || self.next_page != self.op_start_page {
            tracing::debug!(
                "discarding {} staged blocks and {} allocations",
                self.staged.len(),
                self.next_page - self.op_start_page
            );
        }
        self.staged.clear();
        self.staged_frees.clear();
        self.next_page = self.op_start_page;
    }

    /// Make every completed operation durable and record the trie root.
    pub fn commit(&mut self, trie_root: PageId, config: &TrieConfig) -> Result<(), StorageError> {
        if !self.staged.is_empty() || !self.staged_frees.is_empty() {
            return Err(StorageError::OperationInFlight);
        }

        let data_end = self.next_page;
        let mut superblock = *self.store.superblock();
        superblock.set_trie_config(config);
        superblock.trie_root = trie_root;
        superblock.stale_pages = self.stale_pages;
        superblock.total_page_count = data_end;

        let count = self.dirty.len() as u64;
        if count > 0 {
            for page in self.dirty.values_mut() {
                page.seal();
            }

            // Journal
            let index_pages = journal_index_pages(count);
            let journal_start = data_end;
            let needed = journal_start + index_pages + count;
            let current = self.store.total_blocks();
            if needed > current {
                self.store.allocate_blocks(needed - current)?;
            }

            let ids: Vec<PageId> = self.dirty.keys().copied().collect();
            for (n, ids) in ids.chunks(IDS_PER_INDEX_PAGE).enumerate() {
                let page = journal_index_page(ids);
                self.store.write_block(journal_start + n as u64, &page)?;
            }
            for (i, page) in self.dirty.values().enumerate() {
                self.store
                    .write_block(journal_start + index_pages + i as u64, page)?;
            }
            self.store.sync()?;

            superblock.sequence += 1;
            superblock.journal_start = journal_start;
            superblock.journal_count = count;
            self.store.write_superblock(superblock)?;
            self.store.sync()?;

            // In place
            for (&page_id, page) in &self.dirty {
                self.store.write_block(page_id, page)?;
            }
            self.store.sync()?;
        }

        superblock.sequence += 1;
        superblock.journal_start = 0;
        superblock.journal_count = 0;
        self.store.write_superblock(superblock)?;
        self.store.sync()?;
        if self.store.total_blocks() > data_end {
            self.store.truncate(data_end)?;
            self.store.sync()?;
        }

        for (page_id, page) in std::mem::take(&mut self.dirty) {
            self.cache.insert(page_id, page);
        }

        tracing::info!(
            "committed {count} blocks (sequence {}, root {trie_root}, {data_end} pages)",
            superblock.sequence
        );
        Ok(())
    }

    /// Track a newly opened cursor.
    #[must_use]
    pub fn cursor_guard(&self) -> CursorGuard {
        CursorGuard::new(&self.open_cursors)
    }

    /// Number of B+tree cursors currently open on this group.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    /// Blocks released so far (durable or not).
    #[must_use]
    pub const fn stale_pages(&self) -> u64 {
        self.stale_pages
    }

    /// Blocks waiting for the next commit.
    #[must_use]
    pub fn pending_blocks(&self) -> usize {
        self.dirty.len()
    }

    /// Whether an operation has staged writes or allocations.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        !self.staged.is_empty() || self.next_page != self.op_start_page
    }

    /// Cached block lookups served and missed.
    #[must_use]
    pub const fn cache_stats(&self) -> (u64, u64) {
        (self.cache.hits(), self.cache.misses())
    }

    const fn check_bounds(&self, page_id: PageId) -> Result<(), StorageError> {
        if page_id < FIRST_DATA_PAGE || page_id >= self.next_page {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: self.next_page,
            });
        }
        Ok(())
    }
}

fn journal_index_pages(count: u64) -> u64 {
    count.div_ceil(IDS_PER_INDEX_PAGE as u64)
}

fn journal_index_page(ids: &[PageId]) -> Page {
    let mut page = Page::new();
    let header = PageHeader {
        page_type: PageType::JournalIndex,
        flags: 0,
        checksum: 0,
    };
    page.write_bytes(0, &header.to_bytes());
    page.write_u32(JOURNAL_COUNT_OFFSET, ids.len() as u32);
    for (i, &page_id) in ids.iter().enumerate() {
        page.write_u64(JOURNAL_IDS_OFFSET + i * 8, page_id);
    }
    page.seal();
    page
}

/// Apply a journal written by an interrupted commit and retire it.
fn replay_journal(store: &mut dyn BlockStore) -> Result<(), StorageError> {
    let superblock = *store.superblock();
    let count = superblock.journal_count;
    let index_pages = journal_index_pages(count);

    let mut ids = Vec::with_capacity(count as usize);
    for n in 0..index_pages {
        let page = store.read_block(superblock.journal_start + n)?;
        let header = page
            .verify()
            .map_err(|e| StorageError::Corruption(format!("journal index {n}: {e}")))?;
        if header.page_type != PageType::JournalIndex {
            return Err(StorageError::Corruption(format!(
                "journal index {n} has page type {:?}",
                header.page_type
            )));
        }
        let listed = page.read_u32(JOURNAL_COUNT_OFFSET) as usize;
        for i in 0..listed.min(IDS_PER_INDEX_PAGE) {
            ids.push(page.read_u64(JOURNAL_IDS_OFFSET + i * 8));
        }
    }
    if ids.len() as u64 != count {
        return Err(StorageError::Corruption(format!(
            "journal lists {} blocks, superblock expects {count}",
            ids.len()
        )));
    }

    for (i, &page_id) in ids.iter().enumerate() {
        let image = store.read_block(superblock.journal_start + index_pages + i as u64)?;
        image
            .verify()
            .map_err(|e| StorageError::Corruption(format!("journal image {i}: {e}")))?;
        store.write_block(page_id, &image)?;
    }
    store.sync()?;

    let mut retired = superblock;
    retired.sequence += 1;
    retired.journal_start = 0;
    retired.journal_count = 0;
    store.write_superblock(retired)?;
    store.sync()?;

    tracing::info!("replayed commit journal of {count} blocks");
    Ok(())
}
