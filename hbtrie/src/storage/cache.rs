//! Bounded cache of clean blocks.
//!
//! The block cache keeps recently read blocks in memory so repeated chunk
//! lookups along the same trie path do not go back to the block store.
//!
//! # Design
//!
//! - Holds only clean blocks: a block is inserted after it is read from or
//!   made durable in the store, never while it is dirty
//! - FIFO eviction with a fixed capacity chosen at construction time
//! - A capacity of 0 disables caching entirely
//!
//! # Invariants
//!
//! - `pages.len() == order.len() <= capacity`
//! - Every id in `order` has an entry in `pages`

use std::collections::{HashMap, VecDeque};

use crate::storage::page::{Page, PageId};

/// A FIFO cache of clean blocks.
#[derive(Debug)]
pub struct BlockCache {
    pages: HashMap<PageId, Page>,
    order: VecDeque<PageId>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` blocks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a cached block.
    pub fn get(&mut self, page_id: PageId) -> Option<&Page> {
        let page = self.pages.get(&page_id);
        if page.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        page
    }

    /// Insert or replace a clean block, evicting the oldest entry when full.
    pub fn insert(&mut self, page_id: PageId, page: Page) {
        if self.capacity == 0 {
            return;
        }
        if self.pages.insert(page_id, page).is_some() {
            return;
        }
        self.order.push_back(page_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.pages.remove(&evicted);
            }
        }
    }

    /// Drop a block from the cache (it was freed or rewritten).
    pub fn remove(&mut self, page_id: PageId) {
        if self.pages.remove(&page_id).is_some() {
            self.order.retain(|&id| id != page_id);
        }
    }

    /// Drop every cached block.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.order.clear();
    }

    /// Number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Get the total capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of lookups served from the cache.
    #[must_use]
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    /// Number of lookups that missed.
    #[must_use]
    pub const fn misses(&self) -> u64 {
        self.misses
    }
}
