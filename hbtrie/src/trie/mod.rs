//! The hierarchical B+tree trie.
//!
//! An `HbTrie` indexes variable-length keys as a tree of B+trees. Level 0 is
//! keyed by each key's first chunk; an entry either holds the value of the
//! only key under that chunk or points at the structure holding the whole
//! group of keys sharing it:
//!
//! - a sub-level keyed by the next chunk,
//! - an inline meta-section of (suffix, value) tails when `compact` is set,
//! - a flat leaf tree of (suffix, value) once the depth reaches
//!   `leaf_height_limit`.
//!
//! Values are fixed-size records, usually document log offsets. Levels only
//! keep as many chunks as needed to tell keys apart, so the trie asks its
//! [`KeyResolver`] for the full key behind a value whenever it must compare.
//!
//! # Operations and durability
//!
//! Every mutation is one block group operation: its blocks are staged and
//! folded into the pending set when it succeeds, or dropped when it fails,
//! leaving the trie exactly as it was. Nothing reaches the store until
//! [`HbTrie::commit`].

mod chunk;
mod child;
mod error;
mod iter;
mod mutate;
mod resolver;

pub use chunk::ChunkCodec;
pub use child::{ChildRef, META_HEADER_SIZE, META_SECTION_CAPACITY, Tail, meta_fits};
pub use error::HbTrieError;
pub use iter::HbTrieIterator;
pub use resolver::{KeyResolver, ResolveError, read_reference};

use crate::config::TrieConfig;
use crate::storage::btree::BTree;
use crate::storage::{BlockGroup, PageId};

/// Longest key the trie accepts.
pub const MAX_KEY_LEN: usize = 1024;

/// Shape of a trie, counted level by level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrieStats {
    /// Trie levels, the root level included.
    pub levels: usize,
    /// Depth of the deepest level. The root level has depth 0.
    pub max_depth: usize,
    /// Keys held directly by level entries.
    pub values: usize,
    pub meta_sections: usize,
    pub meta_entries: usize,
    pub leaf_trees: usize,
    pub leaf_entries: usize,
    /// Total keys in the trie.
    pub keys: usize,
}

/// A trie over a block group.
pub struct HbTrie<'a, R: KeyResolver> {
    blocks: &'a mut BlockGroup,
    resolver: R,
    config: TrieConfig,
    codec: ChunkCodec,
    root: PageId,
}

impl<'a, R: KeyResolver> HbTrie<'a, R> {
    /// Create an empty trie.
    pub fn new(
        blocks: &'a mut BlockGroup,
        resolver: R,
        config: TrieConfig,
    ) -> Result<Self, HbTrieError> {
        Self::with_root(blocks, resolver, config, 0)
    }

    /// Attach to a trie whose root level starts at `root` (`0` for empty).
    pub fn with_root(
        blocks: &'a mut BlockGroup,
        resolver: R,
        config: TrieConfig,
        root: PageId,
    ) -> Result<Self, HbTrieError> {
        config.validate()?;
        Ok(Self {
            blocks,
            resolver,
            codec: ChunkCodec::new(config.chunk_size),
            config,
            root,
        })
    }

    /// Attach to the trie recorded by the last commit.
    ///
    /// `fallback` is used when the store has never committed a trie.
    pub fn open(
        blocks: &'a mut BlockGroup,
        resolver: R,
        fallback: TrieConfig,
    ) -> Result<Self, HbTrieError> {
        let superblock = blocks.superblock();
        let root = superblock.trie_root;
        let config = superblock.trie_config().unwrap_or(fallback);
        tracing::debug!("opening trie at root {root} with {config:?}");
        Self::with_root(blocks, resolver, config, root)
    }

    /// Page of the root level, `0` while the trie has never held a key.
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.root
    }

    #[must_use]
    pub const fn config(&self) -> &TrieConfig {
        &self.config
    }

    #[must_use]
    pub const fn resolver(&self) -> &R {
        &self.resolver
    }

    /// The block group the trie lives in.
    #[must_use]
    pub const fn blocks(&self) -> &BlockGroup {
        self.blocks
    }

    /// Enable or disable meta-section compaction.
    pub const fn set_compact(&mut self, compact: bool) -> Result<(), HbTrieError> {
        if self.root != 0 {
            return Err(HbTrieError::FlagsFrozen);
        }
        self.config.compact = compact;
        Ok(())
    }

    /// Set the depth at which key groups flatten into leaf trees. `0`
    /// disables leaf trees.
    pub const fn set_leaf_height_limit(&mut self, limit: usize) -> Result<(), HbTrieError> {
        if self.root != 0 {
            return Err(HbTrieError::FlagsFrozen);
        }
        self.config.leaf_height_limit = limit;
        Ok(())
    }

    /// Insert or update a key, returning the previous value.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, HbTrieError> {
        check_key(key)?;
        if value.len() != self.config.value_size {
            return Err(HbTrieError::InvalidValueSize {
                expected: self.config.value_size,
                actual: value.len(),
            });
        }

        self.run(|trie| {
            let root = if trie.root == 0 {
                BTree::create(trie.blocks)?.root_page()
            } else {
                trie.root
            };
            trie.insert_level(root, 0, key, value)
        })
    }

    /// Look up the value of a key.
    pub fn find(&mut self, key: &[u8]) -> Result<Vec<u8>, HbTrieError> {
        check_key(key)?;
        let chunk_size = self.codec.chunk_size();
        let mut level = self.root;
        if level == 0 {
            return Err(HbTrieError::KeyNotFound);
        }

        for depth in 0..self.codec.chunk_count(key.len()) {
            let chunk = self.codec.chunk(key, depth);
            let child = self
                .get_child(level, &chunk)?
                .ok_or(HbTrieError::KeyNotFound)?;

            if self.codec.is_terminal(&chunk) {
                return match child {
                    ChildRef::Value(value) => Ok(value),
                    other => Err(terminal_corruption(&other)),
                };
            }

            let suffix = &key[(depth + 1) * chunk_size..];
            match child {
                ChildRef::SubLevel { root } => level = root,
                ChildRef::Value(value) => {
                    self.confirm_key(&value, key, depth)?;
                    return Ok(value);
                }
                ChildRef::Meta(tails) => {
                    return tails
                        .binary_search_by(|tail| tail.suffix.as_slice().cmp(suffix))
                        .map(|index| tails[index].value.clone())
                        .map_err(|_| HbTrieError::KeyNotFound);
                }
                ChildRef::LeafTree { root } => {
                    return BTree::open(self.blocks, root)
                        .get(suffix)?
                        .ok_or(HbTrieError::KeyNotFound);
                }
            }
        }

        Err(HbTrieError::Corruption(
            "key walk ended without a terminal chunk".to_string(),
        ))
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Result<Vec<u8>, HbTrieError> {
        check_key(key)?;
        if self.root == 0 {
            return Err(HbTrieError::KeyNotFound);
        }
        self.run(|trie| trie.remove_level(trie.root, 0, key))
    }

    /// Iterate in key order, starting at the first key `>= start`.
    #[allow(clippy::iter_not_returning_iterator)] // seeking can fail
    pub fn iter(
        &mut self,
        start: Option<&[u8]>,
    ) -> Result<HbTrieIterator<'_, 'a, R>, HbTrieError> {
        HbTrieIterator::new(self, start)
    }

    /// Walk every level and count what it holds.
    pub fn stats(&mut self) -> Result<TrieStats, HbTrieError> {
        let mut stats = TrieStats::default();
        if self.root == 0 {
            return Ok(stats);
        }

        let mut pending = vec![(self.root, 0)];
        while let Some((level, depth)) = pending.pop() {
            stats.levels += 1;
            stats.max_depth = stats.max_depth.max(depth);

            let mut cursor = BTree::open(self.blocks, level).cursor_from(None)?;
            while let Some(entry) = cursor.next_entry(self.blocks)? {
                match ChildRef::decode(&entry.value)? {
                    ChildRef::SubLevel { root } => pending.push((root, depth + 1)),
                    ChildRef::Value(_) => stats.values += 1,
                    ChildRef::Meta(tails) => {
                        stats.meta_sections += 1;
                        stats.meta_entries += tails.len();
                    }
                    ChildRef::LeafTree { root } => {
                        stats.leaf_trees += 1;
                        stats.leaf_entries += BTree::open(self.blocks, root).count()?;
                    }
                }
            }
        }

        stats.keys = stats.values + stats.meta_entries + stats.leaf_entries;
        Ok(stats)
    }

    /// Make every completed operation durable, recording the root and
    /// configuration in the superblock.
    pub fn commit(&mut self) -> Result<(), HbTrieError> {
        self.blocks.commit(self.root, &self.config)?;
        Ok(())
    }

    /// Run one mutation as a block group operation.
    ///
    /// `op` returns its result and the new root. The root is only replaced
    /// when the operation succeeds.
    fn run<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<(T, PageId), HbTrieError>,
    ) -> Result<T, HbTrieError> {
        match op(self) {
            Ok((output, root)) => {
                self.blocks.end();
                if root != self.root {
                    tracing::debug!("trie root moved from {} to {root}", self.root);
                    self.root = root;
                }
                Ok(output)
            }
            Err(e) => {
                if e.is_fatal() {
                    tracing::warn!("trie operation failed, discarding its blocks: {e}");
                }
                self.blocks.discard();
                Err(e)
            }
        }
    }

    /// Decode the child stored under `chunk` in a level.
    fn get_child(
        &mut self,
        level_root: PageId,
        chunk: &[u8],
    ) -> Result<Option<ChildRef>, HbTrieError> {
        BTree::open(self.blocks, level_root)
            .get(chunk)?
            .map(|encoded| ChildRef::decode(&encoded))
            .transpose()
    }

    /// Store `child` under `chunk`, returning the level's root.
    fn put_child(
        &mut self,
        level_root: PageId,
        chunk: &[u8],
        child: &ChildRef,
    ) -> Result<PageId, HbTrieError> {
        let mut level = BTree::open(self.blocks, level_root);
        level.insert(chunk, &child.encode())?;
        Ok(level.root_page())
    }

    /// Check that the key behind a non-terminal value at `depth` is `key`.
    ///
    /// A resolved key on the same chunk path that differs means `key` is
    /// absent; one off the path means the value and resolver disagree.
    fn confirm_key(&self, value: &[u8], key: &[u8], depth: usize) -> Result<(), HbTrieError> {
        let stored = self.resolver.resolve_key(value)?;
        if stored == key {
            Ok(())
        } else if self.codec.shares_chunks(&stored, key, depth + 1) {
            Err(HbTrieError::KeyNotFound)
        } else {
            Err(HbTrieError::ResolverMismatch)
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), HbTrieError> {
    if key.len() > MAX_KEY_LEN {
        return Err(HbTrieError::KeyTooLong(key.len()));
    }
    Ok(())
}

fn terminal_corruption(child: &ChildRef) -> HbTrieError {
    let kind = match child {
        ChildRef::SubLevel { .. } => "sub-level",
        ChildRef::Value(_) => "value",
        ChildRef::Meta(_) => "meta-section",
        ChildRef::LeafTree { .. } => "leaf tree",
    };
    HbTrieError::Corruption(format!("terminal chunk points at a {kind}"))
}

#[cfg(test)]
mod tests;
