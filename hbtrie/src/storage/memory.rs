//! In-memory block store for deterministic testing.
//!
//! This module provides an in-memory implementation of the `BlockStore`
//! trait with support for fault injection:
//! - Block-level read/write errors
//! - Byte-level corruption (bit flips) on read
//! - Sync failures
//! - Crashes that drop every write not yet synced
//!
//! Blocks live in a `MemoryDisk` that outlives the store handle, so a test can
//! crash the disk, open a new store on it and observe exactly what a real
//! file would contain after a power loss.

// Test stores share the disk between handles
#![allow(clippy::disallowed_methods)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{BlockStore, StorageError};
use crate::storage::page::{PAGE_SIZE, Page, PageId};
use crate::storage::superblock::{SUPERBLOCK_SLOTS, Superblock};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of block corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
    /// Let this many reads succeed, then fail every read.
    pub fail_reads_after: Option<u64>,
    /// Let this many writes succeed, then fail every write.
    pub fail_writes_after: Option<u64>,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            sync_error_rate: 0.001,
            corruption_rate: 0.001,
            fail_reads_after: None,
            fail_writes_after: None,
        }
    }
}

/// Statistics about in-memory store operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryStoreStats {
    /// Number of block reads.
    pub reads: u64,
    /// Number of block writes (superblock slots included).
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of corrupted blocks returned.
    pub corrupted_reads: u64,
}

struct DiskState {
    /// Blocks that survived the last sync.
    durable: HashMap<PageId, Page>,
    /// Blocks written since the last sync.
    pending: HashMap<PageId, Page>,
    durable_total: u64,
    total: u64,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStoreStats,
}

impl DiskState {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Count down a `fail_*_after` budget; `true` once it is used up.
    fn budget_exhausted(budget: &mut Option<u64>) -> bool {
        match budget {
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }

    /// Corrupt a block by flipping random bits.
    fn corrupt_page(&mut self, page: &mut Page) {
        let num_flips = self.rng.random_range(1..=8);
        for _ in 0..num_flips {
            let byte_offset = self.rng.random_range(0..PAGE_SIZE);
            let bit = self.rng.random_range(0..8u8);
            page.as_bytes_mut()[byte_offset] ^= 1 << bit;
        }
    }

    fn current(&self, page_id: PageId) -> Page {
        self.pending
            .get(&page_id)
            .or_else(|| self.durable.get(&page_id))
            .cloned()
            .unwrap_or_default()
    }
}

/// A simulated disk shared by every `MemoryStore` opened on it.
#[derive(Clone)]
pub struct MemoryDisk {
    state: Arc<Mutex<DiskState>>,
}

impl MemoryDisk {
    /// Create a blank disk holding an empty store.
    ///
    /// The seed ensures deterministic behavior - the same seed will
    /// produce the same sequence of faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a blank disk with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        let mut durable = HashMap::new();
        durable.insert(0, Superblock::new().to_page());

        Self {
            state: Arc::new(Mutex::new(DiskState {
                durable,
                pending: HashMap::new(),
                durable_total: SUPERBLOCK_SLOTS,
                total: SUPERBLOCK_SLOTS,
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStoreStats::default(),
            })),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Open a store handle on this disk.
    pub fn open_store(&self) -> Result<MemoryStore, StorageError> {
        let superblock = {
            let state = self.lock();
            Superblock::select(&state.current(0), &state.current(1))
                .map_err(|e| StorageError::Superblock(e.to_string()))?
        };
        Ok(MemoryStore {
            disk: self.clone(),
            superblock,
        })
    }

    /// Simulate a power loss: every write since the last sync is lost.
    pub fn crash(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.total = state.durable_total;
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.lock().fault_config = config;
    }

    /// Get the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        self.lock().stats.clone()
    }

    /// Reset statistics.
    pub fn reset_stats(&self) {
        self.lock().stats = MemoryStoreStats::default();
    }
}

/// In-memory block store handle.
///
/// # Thread Safety
///
/// The shared disk is behind a mutex, but a store handle is meant to be
/// driven by one block group at a time.
pub struct MemoryStore {
    disk: MemoryDisk,
    superblock: Superblock,
}

impl MemoryStore {
    /// Create a store on a fresh, fault-free disk.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            disk: MemoryDisk::new(seed),
            superblock: Superblock::new(),
        }
    }

    /// The disk this store reads and writes.
    #[must_use]
    pub const fn disk(&self) -> &MemoryDisk {
        &self.disk
    }
}

impl BlockStore for MemoryStore {
    fn read_block(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        let mut state = self.disk.lock();
        state.stats.reads += 1;

        if page_id >= state.total {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: state.total,
            });
        }

        let rate = state.fault_config.read_error_rate;
        if DiskState::budget_exhausted(&mut state.fault_config.fail_reads_after)
            || state.should_inject_fault(rate)
        {
            state.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "simulated read error on page {page_id}"
            )));
        }

        let mut page = state.current(page_id);

        let rate = state.fault_config.corruption_rate;
        if state.should_inject_fault(rate) {
            state.stats.corrupted_reads += 1;
            state.corrupt_page(&mut page);
        }

        Ok(page)
    }

    fn write_block(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        let mut state = self.disk.lock();
        state.stats.writes += 1;

        if page_id >= state.total {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: state.total,
            });
        }

        let rate = state.fault_config.write_error_rate;
        if DiskState::budget_exhausted(&mut state.fault_config.fail_writes_after)
            || state.should_inject_fault(rate)
        {
            state.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "simulated write error on page {page_id}"
            )));
        }

        state.pending.insert(page_id, page.clone());
        Ok(())
    }

    fn allocate_blocks(&mut self, count: u64) -> Result<PageId, StorageError> {
        let mut state = self.disk.lock();
        let first_new_page = state.total;
        state.total += count;
        Ok(first_new_page)
    }

    fn truncate(&mut self, total_pages: u64) -> Result<(), StorageError> {
        let mut state = self.disk.lock();
        let total_pages = total_pages.max(SUPERBLOCK_SLOTS);
        state.total = total_pages;
        state.pending.retain(|&id, _| id < total_pages);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        let mut state = self.disk.lock();
        state.stats.syncs += 1;

        let rate = state.fault_config.sync_error_rate;
        if state.should_inject_fault(rate) {
            state.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        let pending: Vec<(PageId, Page)> = state.pending.drain().collect();
        state.durable.extend(pending);
        let total = state.total;
        state.durable.retain(|&id, _| id < total);
        state.durable_total = total;
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.disk.lock().total
    }

    fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn write_superblock(&mut self, superblock: Superblock) -> Result<(), StorageError> {
        self.write_block(superblock.slot(), &superblock.to_page())?;
        self.superblock = superblock;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic() {
        let mut store = MemoryStore::new(12345);
        assert_eq!(store.total_blocks(), 2);

        let first_page = store.allocate_blocks(5).unwrap();
        assert_eq!(first_page, 2);
        assert_eq!(store.total_blocks(), 7);

        let mut page = Page::new();
        page.write_bytes(0, b"hello world");
        store.write_block(4, &page).unwrap();

        let read_page = store.read_block(4).unwrap();
        assert_eq!(read_page.read_bytes(0, 11), b"hello world");
    }

    #[test]
    fn test_crash_drops_unsynced_writes() {
        let disk = MemoryDisk::new(1);
        let mut store = disk.open_store().unwrap();
        store.allocate_blocks(2).unwrap();

        let mut page = Page::new();
        page.write_u64(64, 11);
        store.write_block(2, &page).unwrap();
        store.sync().unwrap();

        page.write_u64(64, 22);
        store.write_block(2, &page).unwrap();
        store.write_block(3, &page).unwrap();
        disk.crash();

        let mut reopened = disk.open_store().unwrap();
        assert_eq!(reopened.read_block(2).unwrap().read_u64(64), 11);
        assert_eq!(reopened.read_block(3).unwrap().read_u64(64), 0);
    }

    #[test]
    fn test_superblock_survives_reopen() {
        let disk = MemoryDisk::new(1);
        let mut store = disk.open_store().unwrap();

        let mut sb = *store.superblock();
        sb.sequence = 1;
        sb.trie_root = 77;
        store.write_superblock(sb).unwrap();
        store.sync().unwrap();

        let reopened = disk.open_store().unwrap();
        assert_eq!(reopened.superblock().trie_root, 77);
    }

    #[test]
    fn test_fault_injection() {
        let config = FaultConfig {
            read_error_rate: 1.0, // Always fail
            ..Default::default()
        };
        let disk = MemoryDisk::with_config(12345, config);
        let mut store = disk.open_store().unwrap();
        store.allocate_blocks(1).unwrap();

        assert!(matches!(
            store.read_block(2),
            Err(StorageError::InjectedFault(_))
        ));
        assert_eq!(disk.stats().injected_read_errors, 1);

        disk.set_fault_config(FaultConfig::no_faults());
        assert!(store.read_block(2).is_ok());
    }

    #[test]
    fn test_fail_writes_after_budget() {
        let disk = MemoryDisk::with_config(
            7,
            FaultConfig {
                fail_writes_after: Some(2),
                ..Default::default()
            },
        );
        let mut store = disk.open_store().unwrap();
        store.allocate_blocks(4).unwrap();

        let page = Page::new();
        assert!(store.write_block(2, &page).is_ok());
        assert!(store.write_block(3, &page).is_ok());
        assert!(store.write_block(4, &page).is_err());
        assert!(store.write_block(5, &page).is_err());
        assert_eq!(disk.stats().injected_write_errors, 2);
    }

    #[test]
    fn test_deterministic_faults() {
        let run = |seed| {
            let disk = MemoryDisk::with_config(seed, FaultConfig {
                read_error_rate: 0.5,
                ..Default::default()
            });
            let mut store = disk.open_store().unwrap();
            store.allocate_blocks(1).unwrap();
            (0..32)
                .map(|_| store.read_block(2).is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(99), run(99));
    }
}
