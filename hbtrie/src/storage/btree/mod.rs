//! B+tree implementation for the block store.
//!
//! Every trie level, and every leaf tree that replaces a skewed subtree, is
//! one of these trees.
//!
//! # Structure
//!
//! The B+tree consists of:
//! - Internal nodes: store separator keys and child page pointers
//! - Leaf nodes: store key-value pairs, doubly-linked for range scans
//!
//! # Key Format
//!
//! Keys and values are arbitrary byte strings ordered lexicographically. An
//! encoded entry may take at most `MAX_ENTRY_SIZE` bytes.

mod node;
mod tree;

pub use node::{
    DATA_SPACE, InternalNode, LeafEntry, LeafNode, MAX_ENTRY_SIZE, NodeError, NodeHeader, NodeType,
};
pub use tree::{BTree, BTreeCursor, BTreeError};
