//! B+tree over a block group.
//!
//! Each trie level and each leaf tree is one of these trees: a map from
//! variable-length byte keys to variable-length byte values, ordered
//! lexicographically. Every block it touches goes through the block group,
//! so an operation's writes stay staged until the caller ends it.
//!
//! Removal never rebalances. Leaves may become empty; cursors skip them.

use crate::storage::btree::node::{
    InternalNode, LeafEntry, LeafNode, MAX_ENTRY_SIZE, NodeError, NodeHeader, NodeType,
};
use crate::storage::group::{BlockGroup, CursorGuard};
use crate::storage::io::StorageError;
use crate::storage::page::{Page, PageId};

/// A B+tree handle borrowing the block group for its lifetime.
pub struct BTree<'a> {
    blocks: &'a mut BlockGroup,
    root_page: PageId,
}

impl<'a> BTree<'a> {
    /// Create a new empty tree with a leaf root.
    pub fn create(blocks: &'a mut BlockGroup) -> Result<Self, BTreeError> {
        let root_page = blocks.allocate_block();
        let mut tree = Self { blocks, root_page };
        tree.write_leaf(root_page, &LeafNode::new(0))?;
        Ok(tree)
    }

    /// Open an existing tree.
    #[must_use]
    pub const fn open(blocks: &'a mut BlockGroup, root_page: PageId) -> Self {
        Self { blocks, root_page }
    }

    /// Get the root page ID. Changes when the root splits.
    #[must_use]
    pub const fn root_page(&self) -> PageId {
        self.root_page
    }

    /// Look up a value by key.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        let leaf_page_id = self.find_leaf(key)?;
        let leaf = self.read_leaf(leaf_page_id)?;
        Ok(leaf.get(key).map(<[u8]>::to_vec))
    }

    /// Insert or update a key-value pair.
    ///
    /// Returns the old value if updating, None if inserting.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        let size = LeafEntry::size_for(key.len(), value.len());
        if size > MAX_ENTRY_SIZE {
            return Err(BTreeError::Node(NodeError::EntryTooLarge(size)));
        }

        let leaf_page_id = self.find_leaf(key)?;
        let mut leaf = self.read_leaf(leaf_page_id)?;
        let old_value = leaf.insert(key, value);

        if leaf.is_overfull() {
            self.split_leaf(leaf_page_id, leaf)?;
        } else {
            self.write_leaf(leaf_page_id, &leaf)?;
        }

        Ok(old_value)
    }

    /// Remove a key-value pair.
    ///
    /// Returns the removed value if found.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        let leaf_page_id = self.find_leaf(key)?;
        let mut leaf = self.read_leaf(leaf_page_id)?;

        let removed = leaf.remove(key);
        if removed.is_some() {
            self.write_leaf(leaf_page_id, &leaf)?;
        }
        Ok(removed)
    }

    /// Open a cursor at the first key `>= start`, or at the first key.
    pub fn cursor_from(&mut self, start: Option<&[u8]>) -> Result<BTreeCursor, BTreeError> {
        let (page_id, leaf) = match start {
            Some(key) => {
                let page_id = self.find_leaf(key)?;
                (page_id, self.read_leaf(page_id)?)
            }
            None => {
                let page_id = self.leftmost_leaf()?;
                (page_id, self.read_leaf(page_id)?)
            }
        };
        let index = start.map_or(0, |key| leaf.lower_bound(key));

        Ok(BTreeCursor {
            page_id,
            index,
            next_leaf: leaf.header.next_leaf,
            entries: Some(leaf.entries),
            _guard: self.blocks.cursor_guard(),
        })
    }

    /// Count the total number of entries in the tree.
    pub fn count(&mut self) -> Result<usize, BTreeError> {
        let mut count = 0;
        let mut current_page_id = self.leftmost_leaf()?;

        loop {
            let leaf = self.read_leaf(current_page_id)?;
            count += leaf.entries.len();

            if leaf.header.next_leaf == 0 {
                break;
            }
            current_page_id = leaf.header.next_leaf;
        }

        Ok(count)
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&mut self) -> Result<bool, BTreeError> {
        let mut cursor = self.cursor_from(None)?;
        Ok(cursor.peek_entry(self.blocks)?.is_none())
    }

    /// Release every block of the tree.
    ///
    /// Returns the number of blocks released.
    pub fn destroy(self) -> Result<u64, BTreeError> {
        let blocks = self.blocks;
        let mut released = 0;
        let mut pending = vec![self.root_page];

        while let Some(page_id) = pending.pop() {
            let page = blocks.read_block(page_id)?;
            let header =
                NodeHeader::from_page(&page).ok_or(BTreeError::Node(NodeError::InvalidHeader))?;
            if header.node_type == NodeType::Internal {
                let node = InternalNode::from_page(&page)?;
                pending.extend(node.children);
            }
            blocks.free_block(page_id);
            released += 1;
        }

        Ok(released)
    }

    /// Find the leaf page that should contain the given key.
    fn find_leaf(&mut self, key: &[u8]) -> Result<PageId, BTreeError> {
        let mut current_page_id = self.root_page;

        loop {
            let page = self.blocks.read_block(current_page_id)?;
            let header =
                NodeHeader::from_page(&page).ok_or(BTreeError::Node(NodeError::InvalidHeader))?;

            match header.node_type {
                NodeType::Leaf => return Ok(current_page_id),
                NodeType::Internal => {
                    let node = InternalNode::from_page(&page)?;
                    current_page_id = node.children[node.find_child_index(key)];
                }
            }
        }
    }

    fn leftmost_leaf(&mut self) -> Result<PageId, BTreeError> {
        let mut current_page_id = self.root_page;

        loop {
            let page = self.blocks.read_block(current_page_id)?;
            let header =
                NodeHeader::from_page(&page).ok_or(BTreeError::Node(NodeError::InvalidHeader))?;

            match header.node_type {
                NodeType::Leaf => return Ok(current_page_id),
                NodeType::Internal => {
                    let node = InternalNode::from_page(&page)?;
                    current_page_id = node.children[0];
                }
            }
        }
    }

    /// Split an overfull leaf and push the separator into its parent.
    fn split_leaf(&mut self, leaf_page_id: PageId, mut leaf: LeafNode) -> Result<(), BTreeError> {
        let (split_key, mut right_leaf) = leaf.split();
        let right_page_id = self.blocks.allocate_block();

        // Update sibling pointers
        right_leaf.header.prev_leaf = leaf_page_id;
        right_leaf.header.next_leaf = leaf.header.next_leaf;
        leaf.header.next_leaf = right_page_id;

        self.write_leaf(leaf_page_id, &leaf)?;
        self.write_leaf(right_page_id, &right_leaf)?;

        if right_leaf.header.next_leaf != 0 {
            let mut next_leaf = self.read_leaf(right_leaf.header.next_leaf)?;
            next_leaf.header.prev_leaf = right_page_id;
            self.write_leaf(right_leaf.header.next_leaf, &next_leaf)?;
        }

        self.insert_into_parent(
            leaf_page_id,
            split_key,
            right_page_id,
            leaf.header.parent_page,
        )
    }

    /// Insert a new key into a parent node after a child split.
    fn insert_into_parent(
        &mut self,
        left_child: PageId,
        key: Vec<u8>,
        right_child: PageId,
        parent_page_id: PageId,
    ) -> Result<(), BTreeError> {
        if parent_page_id == 0 {
            return self.create_new_root(left_child, key, right_child);
        }

        let page = self.blocks.read_block(parent_page_id)?;
        let mut parent = InternalNode::from_page(&page)?;
        parent.insert(key, right_child);

        if !parent.is_overfull() {
            return self.write_internal(parent_page_id, &parent);
        }

        let (median_key, right_parent) = parent.split();
        let right_parent_page_id = self.blocks.allocate_block();

        self.write_internal(parent_page_id, &parent)?;
        self.write_internal(right_parent_page_id, &right_parent)?;

        for &child_id in &right_parent.children {
            self.update_parent_pointer(child_id, right_parent_page_id)?;
        }

        self.insert_into_parent(
            parent_page_id,
            median_key,
            right_parent_page_id,
            parent.header.parent_page,
        )
    }

    /// Create a new root node after the old root splits.
    fn create_new_root(
        &mut self,
        left_child: PageId,
        key: Vec<u8>,
        right_child: PageId,
    ) -> Result<(), BTreeError> {
        let new_root = InternalNode::with_children(0, left_child, key, right_child);
        let new_root_page_id = self.blocks.allocate_block();
        self.write_internal(new_root_page_id, &new_root)?;

        self.update_parent_pointer(left_child, new_root_page_id)?;
        self.update_parent_pointer(right_child, new_root_page_id)?;

        self.root_page = new_root_page_id;
        Ok(())
    }

    /// Update a node's parent pointer.
    fn update_parent_pointer(
        &mut self,
        page_id: PageId,
        new_parent: PageId,
    ) -> Result<(), BTreeError> {
        let page = self.blocks.read_block(page_id)?;
        let header =
            NodeHeader::from_page(&page).ok_or(BTreeError::Node(NodeError::InvalidHeader))?;

        match header.node_type {
            NodeType::Leaf => {
                let mut node = LeafNode::from_page(&page)?;
                node.header.parent_page = new_parent;
                self.write_leaf(page_id, &node)
            }
            NodeType::Internal => {
                let mut node = InternalNode::from_page(&page)?;
                node.header.parent_page = new_parent;
                self.write_internal(page_id, &node)
            }
        }
    }

    fn read_leaf(&mut self, page_id: PageId) -> Result<LeafNode, BTreeError> {
        let page = self.blocks.read_block(page_id)?;
        Ok(LeafNode::from_page(&page)?)
    }

    fn write_leaf(&mut self, page_id: PageId, leaf: &LeafNode) -> Result<(), BTreeError> {
        let mut page = Page::new();
        leaf.write_to_page(&mut page);
        Ok(self.blocks.write_block(page_id, page)?)
    }

    fn write_internal(&mut self, page_id: PageId, node: &InternalNode) -> Result<(), BTreeError> {
        let mut page = Page::new();
        node.write_to_page(&mut page);
        Ok(self.blocks.write_block(page_id, page)?)
    }
}

/// A position in a B+tree's leaf chain.
///
/// The cursor holds no borrow of the block group; each step takes it
/// explicitly. It stays registered with the group until dropped.
#[derive(Debug)]
pub struct BTreeCursor {
    page_id: PageId,
    index: usize,
    next_leaf: PageId,
    /// Entries of the current leaf, loaded lazily.
    entries: Option<Vec<LeafEntry>>,
    _guard: CursorGuard,
}

impl BTreeCursor {
    /// Move past exhausted (or empty) leaves. Returns `false` at the end.
    fn settle(&mut self, blocks: &mut BlockGroup) -> Result<bool, BTreeError> {
        loop {
            if self.entries.is_none() {
                if self.page_id == 0 {
                    return Ok(false);
                }
                let page = blocks.read_block(self.page_id)?;
                let leaf = LeafNode::from_page(&page)?;
                self.next_leaf = leaf.header.next_leaf;
                self.entries = Some(leaf.entries);
            }

            let len = self.entries.as_ref().map_or(0, Vec::len);
            if self.index < len {
                return Ok(true);
            }

            self.page_id = self.next_leaf;
            self.index = 0;
            self.entries = None;
        }
    }

    /// The entry under the cursor, without advancing.
    pub fn peek_entry(
        &mut self,
        blocks: &mut BlockGroup,
    ) -> Result<Option<&LeafEntry>, BTreeError> {
        if !self.settle(blocks)? {
            return Ok(None);
        }
        Ok(self.entries.as_ref().and_then(|e| e.get(self.index)))
    }

    /// The entry under the cursor, advancing past it.
    pub fn next_entry(&mut self, blocks: &mut BlockGroup) -> Result<Option<LeafEntry>, BTreeError> {
        if !self.settle(blocks)? {
            return Ok(None);
        }
        let index = self.index;
        let Some(entries) = self.entries.as_mut() else {
            return Ok(None);
        };
        self.index += 1;
        Ok(entries.get_mut(index).map(std::mem::take))
    }
}

/// Errors that can occur during B+tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Block storage error.
    Storage(StorageError),
    /// Node error.
    Node(NodeError),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Node(e) => Some(e),
        }
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}
