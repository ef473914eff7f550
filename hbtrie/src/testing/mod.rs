//! Fixtures shared by the crate's tests.

use std::sync::Mutex;

use crate::config::StoreConfig;
use crate::storage::{BlockGroup, MemoryDisk};
use crate::trie::{KeyResolver, ResolveError, read_reference};

/// Install a fmt subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A block group on a fresh in-memory disk.
pub fn memory_group() -> BlockGroup {
    open_memory_group(&MemoryDisk::new(1), StoreConfig::default())
}

/// A block group on an existing in-memory disk.
pub fn open_memory_group(disk: &MemoryDisk, config: StoreConfig) -> BlockGroup {
    let store = disk.open_store().expect("open memory store");
    BlockGroup::open(store, &config).expect("open block group")
}

/// Resolves values that are indexes into an in-memory key table.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    keys: Mutex<Vec<Vec<u8>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key, returning the 8-byte value that resolves to it.
    pub fn push(&self, key: &[u8]) -> Vec<u8> {
        let mut keys = self.keys.lock().expect("resolver lock");
        keys.push(key.to_vec());
        ((keys.len() - 1) as u64).to_le_bytes().to_vec()
    }
}

impl KeyResolver for MemoryResolver {
    fn resolve_key(&self, value: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let reference = read_reference(value)?;
        let keys = self.keys.lock().expect("resolver lock");
        usize::try_from(reference)
            .ok()
            .and_then(|index| keys.get(index))
            .cloned()
            .ok_or_else(|| ResolveError::Unavailable {
                reference,
                reason: format!("only {} keys recorded", keys.len()),
            })
    }
}
