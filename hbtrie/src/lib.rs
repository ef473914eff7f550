#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Life of an insert:
// 1. The key is split into chunks
// 2. Each chunk is looked up in one trie level (a B+tree) after another
// 3. Where two keys first share a chunk, their group is rebuilt as a
//    sub-level, a meta-section or a leaf tree
// 4. Blocks written along the way stay staged in the block group until the
//    operation ends, and reach the file on commit
//
// System components:
//  - Block store and block group (staging, cache, commit journal)
//  - B+tree over blocks
//  - Document log holding the keys the trie resolves values to
//  - The trie and its iterator

pub mod config;
pub mod storage;
#[cfg(test)]
mod testing;
pub mod trie;

pub use config::{ConfigError, StoreConfig, TrieConfig};
pub use trie::{
    HbTrie, HbTrieError, HbTrieIterator, KeyResolver, MAX_KEY_LEN, ResolveError, TrieStats,
};
