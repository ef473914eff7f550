//! B+tree node types and serialization.
//!
//! Keys and values are variable-length byte strings compared
//! lexicographically:
//! - Internal nodes: store separator keys and child page pointers
//! - Leaf nodes: store key-value pairs, doubly-linked for range scans
//!
//! Nodes are decoded into owned vectors, modified, and re-encoded. A node may
//! briefly hold more than a page worth of entries between an insert and the
//! split that follows it.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageId, PageType};

/// Node header layout (after page header):
/// - `node_type`: 1 byte (0 = internal, 1 = leaf)
/// - `key_count`: 2 bytes
/// - `parent_page`: 8 bytes
/// - `prev_leaf`: 8 bytes (only for leaf nodes, 0 if none)
/// - `next_leaf`: 8 bytes (only for leaf nodes, 0 if none)
///
/// Total: 27 bytes
const NODE_HEADER_SIZE: usize = 27;

/// Offset where node data starts (after page header + node header).
const DATA_OFFSET: usize = PageHeader::SIZE + NODE_HEADER_SIZE;

/// Available space for node data.
pub const DATA_SPACE: usize = PAGE_SIZE - DATA_OFFSET;

/// Leaf entry overhead: `key_len` (2 bytes) + `value_len` (2 bytes).
const LEAF_ENTRY_OVERHEAD: usize = 4;

/// Internal entry overhead: `key_len` (2 bytes) + child pointer (8 bytes).
const INTERNAL_ENTRY_OVERHEAD: usize = 2 + 8;

/// Largest encoded leaf entry. Keeps at least three entries per page, so a
/// split always produces two halves that fit.
pub const MAX_ENTRY_SIZE: usize = DATA_SPACE / 3;

/// Node type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Internal = 0,
    Leaf = 1,
}

impl TryFrom<u8> for NodeType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Internal),
            1 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// Header information for a B+tree node.
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    pub node_type: NodeType,
    pub key_count: u16,
    pub parent_page: PageId,
    pub prev_leaf: PageId,
    pub next_leaf: PageId,
}

impl NodeHeader {
    /// Read a node header from a page.
    #[must_use]
    pub fn from_page(page: &Page) -> Option<Self> {
        let offset = PageHeader::SIZE;
        let node_type = NodeType::try_from(page.read_u8(offset)).ok()?;

        Some(Self {
            node_type,
            key_count: page.read_u16(offset + 1),
            parent_page: page.read_u64(offset + 3),
            prev_leaf: page.read_u64(offset + 11),
            next_leaf: page.read_u64(offset + 19),
        })
    }

    /// Write a node header to a page.
    pub fn write_to_page(&self, page: &mut Page) {
        let offset = PageHeader::SIZE;
        page.write_u8(offset, self.node_type as u8);
        page.write_u16(offset + 1, self.key_count);
        page.write_u64(offset + 3, self.parent_page);
        page.write_u64(offset + 11, self.prev_leaf);
        page.write_u64(offset + 19, self.next_leaf);
    }

    const fn empty(node_type: NodeType, parent_page: PageId) -> Self {
        Self {
            node_type,
            key_count: 0,
            parent_page,
            prev_leaf: 0,
            next_leaf: 0,
        }
    }
}

fn write_page_header(page: &mut Page, page_type: PageType) {
    let header = PageHeader {
        page_type,
        flags: 0,
        checksum: 0,
    };
    page.write_bytes(0, &header.to_bytes());
}

/// Bounds-checked sequential reader over the data area of a node page.
struct NodeReader<'p> {
    page: &'p Page,
    offset: usize,
}

impl<'p> NodeReader<'p> {
    const fn new(page: &'p Page) -> Self {
        Self {
            page,
            offset: DATA_OFFSET,
        }
    }

    const fn claim(&mut self, len: usize) -> Result<usize, NodeError> {
        let start = self.offset;
        if start + len > PAGE_SIZE {
            return Err(NodeError::Truncated { offset: start });
        }
        self.offset += len;
        Ok(start)
    }

    fn u16(&mut self) -> Result<usize, NodeError> {
        let at = self.claim(2)?;
        Ok(self.page.read_u16(at) as usize)
    }

    fn u64(&mut self) -> Result<u64, NodeError> {
        let at = self.claim(8)?;
        Ok(self.page.read_u64(at))
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, NodeError> {
        let at = self.claim(len)?;
        Ok(self.page.read_bytes(at, len).to_vec())
    }
}

/// An internal (non-leaf) B+tree node.
///
/// Stores N keys and N+1 child pointers.
/// `Child[i]` contains keys < `Key[i]`
/// `Child[i+1]` contains keys >= `Key[i]`
#[derive(Debug)]
pub struct InternalNode {
    pub header: NodeHeader,
    /// Separator keys in sorted order.
    pub keys: Vec<Vec<u8>>,
    /// Child page pointers. `children.len()` == `keys.len()` + 1
    pub children: Vec<PageId>,
}

impl InternalNode {
    /// Create an internal node with initial children.
    #[must_use]
    pub fn with_children(
        parent_page: PageId,
        left_child: PageId,
        key: Vec<u8>,
        right_child: PageId,
    ) -> Self {
        Self {
            header: NodeHeader::empty(NodeType::Internal, parent_page),
            keys: vec![key],
            children: vec![left_child, right_child],
        }
    }

    /// Read an internal node from a page.
    pub fn from_page(page: &Page) -> Result<Self, NodeError> {
        let header = NodeHeader::from_page(page).ok_or(NodeError::InvalidHeader)?;
        if header.node_type != NodeType::Internal {
            return Err(NodeError::WrongNodeType);
        }

        let key_count = header.key_count as usize;
        let mut keys = Vec::with_capacity(key_count);
        let mut children = Vec::with_capacity(key_count + 1);

        let mut reader = NodeReader::new(page);
        children.push(reader.u64()?);
        for _ in 0..key_count {
            let key_len = reader.u16()?;
            keys.push(reader.bytes(key_len)?);
            children.push(reader.u64()?);
        }

        Ok(Self {
            header,
            keys,
            children,
        })
    }

    /// Write an internal node to a page.
    pub fn write_to_page(&self, page: &mut Page) {
        write_page_header(page, PageType::BTreeInternal);

        let mut header = self.header;
        header.key_count = self.keys.len() as u16;
        header.write_to_page(page);

        let mut offset = DATA_OFFSET;
        page.write_u64(offset, self.children.first().copied().unwrap_or(0));
        offset += 8;

        for (key, &child) in self.keys.iter().zip(self.children.iter().skip(1)) {
            page.write_u16(offset, key.len() as u16);
            offset += 2;
            page.write_bytes(offset, key);
            offset += key.len();
            page.write_u64(offset, child);
            offset += 8;
        }
    }

    /// Serialized size of the node data.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        8 + self
            .keys
            .iter()
            .map(|k| INTERNAL_ENTRY_OVERHEAD + k.len())
            .sum::<usize>()
    }

    /// Whether the node no longer fits in a page.
    #[must_use]
    pub fn is_overfull(&self) -> bool {
        self.encoded_size() > DATA_SPACE
    }

    /// Find the child index for a given key.
    #[must_use]
    pub fn find_child_index(&self, key: &[u8]) -> usize {
        match self.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(i) => i + 1, // Exact match, go right
            Err(i) => i,
        }
    }

    /// Insert a key and right child at the appropriate position.
    pub fn insert(&mut self, key: Vec<u8>, right_child: PageId) {
        let idx = self.find_child_index(&key);
        self.keys.insert(idx, key);
        self.children.insert(idx + 1, right_child);
    }

    /// Split the node, returning the promoted key and the new right node.
    ///
    /// The promoted key is chosen by encoded size, so both halves fit in a
    /// page even with keys of very different lengths.
    #[must_use]
    pub fn split(&mut self) -> (Vec<u8>, Self) {
        let half = self.encoded_size() / 2;
        let mut used = 8;
        let mut mid = self.keys.len() - 1;
        for (i, key) in self.keys.iter().enumerate() {
            used += INTERNAL_ENTRY_OVERHEAD + key.len();
            if used > half {
                mid = i;
                break;
            }
        }
        let mid = mid.clamp(1, self.keys.len().saturating_sub(2).max(1));

        let right_keys: Vec<Vec<u8>> = self.keys.drain(mid + 1..).collect();
        let right_children: Vec<PageId> = self.children.drain(mid + 1..).collect();
        let median_key = self.keys.pop().unwrap_or_default();

        let right_node = Self {
            header: NodeHeader::empty(NodeType::Internal, self.header.parent_page),
            keys: right_keys,
            children: right_children,
        };

        (median_key, right_node)
    }
}

/// A key-value entry in a leaf node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LeafEntry {
    /// Serialized size of an entry with the given key and value lengths.
    #[must_use]
    pub const fn size_for(key_len: usize, value_len: usize) -> usize {
        LEAF_ENTRY_OVERHEAD + key_len + value_len
    }

    /// Serialized size of this entry.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        Self::size_for(self.key.len(), self.value.len())
    }
}

/// A leaf B+tree node.
///
/// Stores key-value pairs and links to sibling leaves.
#[derive(Debug)]
pub struct LeafNode {
    pub header: NodeHeader,
    /// Entries in sorted order by key.
    pub entries: Vec<LeafEntry>,
}

impl LeafNode {
    /// Create a new empty leaf node.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::new() is not const-stable
    pub fn new(parent_page: PageId) -> Self {
        Self {
            header: NodeHeader::empty(NodeType::Leaf, parent_page),
            entries: Vec::new(),
        }
    }

    /// Serialized size of all entries.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        self.entries.iter().map(LeafEntry::encoded_size).sum()
    }

    /// Whether the node no longer fits in a page.
    #[must_use]
    pub fn is_overfull(&self) -> bool {
        self.encoded_size() > DATA_SPACE
    }

    /// Read a leaf node from a page.
    pub fn from_page(page: &Page) -> Result<Self, NodeError> {
        let header = NodeHeader::from_page(page).ok_or(NodeError::InvalidHeader)?;
        if header.node_type != NodeType::Leaf {
            return Err(NodeError::WrongNodeType);
        }

        let entry_count = header.key_count as usize;
        let mut entries = Vec::with_capacity(entry_count);

        let mut reader = NodeReader::new(page);
        for _ in 0..entry_count {
            let key_len = reader.u16()?;
            let key = reader.bytes(key_len)?;
            let value_len = reader.u16()?;
            let value = reader.bytes(value_len)?;
            entries.push(LeafEntry { key, value });
        }

        Ok(Self { header, entries })
    }

    /// Write a leaf node to a page.
    pub fn write_to_page(&self, page: &mut Page) {
        write_page_header(page, PageType::BTreeLeaf);

        let mut header = self.header;
        header.key_count = self.entries.len() as u16;
        header.write_to_page(page);

        let mut offset = DATA_OFFSET;
        for entry in &self.entries {
            page.write_u16(offset, entry.key.len() as u16);
            offset += 2;
            page.write_bytes(offset, &entry.key);
            offset += entry.key.len();

            page.write_u16(offset, entry.value.len() as u16);
            offset += 2;
            page.write_bytes(offset, &entry.value);
            offset += entry.value.len();
        }
    }

    /// Find the index where a key should be inserted (or exists).
    pub fn find_index(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    /// Index of the first entry with a key `>= key`.
    #[must_use]
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|e| e.key.as_slice() < key)
    }

    /// Get a value by key.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.find_index(key)
            .ok()
            .map(|i| self.entries[i].value.as_slice())
    }

    /// Insert or update an entry.
    ///
    /// Returns the old value if updating, None if inserting.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        match self.find_index(key) {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i].value, value.to_vec())),
            Err(i) => {
                self.entries.insert(
                    i,
                    LeafEntry {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                );
                None
            }
        }
    }

    /// Remove an entry by key.
    ///
    /// Returns the removed value if found.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.find_index(key)
            .ok()
            .map(|i| self.entries.remove(i).value)
    }

    /// Split the node, returning the split key and the new right node.
    ///
    /// The split point balances encoded size rather than entry count.
    #[must_use]
    pub fn split(&mut self) -> (Vec<u8>, Self) {
        let total = self.encoded_size();
        let mut left = 0;
        let mut mid = 1;
        let mut best = usize::MAX;
        for i in 1..self.entries.len() {
            left += self.entries[i - 1].encoded_size();
            let heavier = left.max(total - left);
            if heavier < best {
                best = heavier;
                mid = i;
            }
        }
        let mid = mid.clamp(1, self.entries.len().saturating_sub(1).max(1));

        let right_entries: Vec<LeafEntry> = self.entries.drain(mid..).collect();
        let split_key = right_entries
            .first()
            .map(|e| e.key.clone())
            .unwrap_or_default();

        let right_node = Self {
            header: NodeHeader {
                node_type: NodeType::Leaf,
                key_count: right_entries.len() as u16,
                parent_page: self.header.parent_page,
                prev_leaf: 0, // Set by caller
                next_leaf: self.header.next_leaf,
            },
            entries: right_entries,
        };

        (split_key, right_node)
    }
}

/// Errors that can occur when working with B+tree nodes.
#[derive(Debug)]
pub enum NodeError {
    /// Invalid node header.
    InvalidHeader,
    /// Wrong node type for operation.
    WrongNodeType,
    /// Entry too large to store in a leaf.
    EntryTooLarge(usize),
    /// An entry runs past the end of the page.
    Truncated { offset: usize },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHeader => write!(f, "invalid node header"),
            Self::WrongNodeType => write!(f, "wrong node type for operation"),
            Self::EntryTooLarge(size) => {
                write!(f, "entry too large: {size} bytes (max {MAX_ENTRY_SIZE})")
            }
            Self::Truncated { offset } => {
                write!(f, "node entry at offset {offset} runs past the page")
            }
        }
    }
}

impl std::error::Error for NodeError {}
