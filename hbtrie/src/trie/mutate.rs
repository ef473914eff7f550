//! Insert and remove, and the group building both rely on.
//!
//! A *group* is the set of keys below one non-terminal chunk. Whenever a
//! group changes shape it is rebuilt from its tails by `build_group`, which
//! picks the representation: a single value, an inline meta-section, a leaf
//! tree, or a sub-level whose entries are built the same way.

use std::collections::BTreeMap;

use crate::storage::PageId;
use crate::storage::btree::BTree;
use crate::trie::child::{ChildRef, META_HEADER_SIZE, META_SECTION_CAPACITY, Tail, meta_fits};
use crate::trie::error::HbTrieError;
use crate::trie::resolver::KeyResolver;
use crate::trie::{HbTrie, terminal_corruption};

/// Tails collected from a sub-level or leaf tree, up to a budget.
struct Gather {
    tails: Vec<Tail>,
    bytes: usize,
    max_tails: usize,
    max_bytes: usize,
}

impl Gather {
    /// Add a tail. Returns `false` once the budget is exceeded.
    fn push(&mut self, tail: Tail) -> bool {
        self.bytes += tail.meta_size();
        self.tails.push(tail);
        self.tails.len() <= self.max_tails && self.bytes <= self.max_bytes
    }
}

impl<R: KeyResolver> HbTrie<'_, R> {
    /// Insert into the level rooted at `level_root`, which sits at `depth`.
    ///
    /// Returns the previous value and the level's (possibly moved) root.
    pub(super) fn insert_level(
        &mut self,
        level_root: PageId,
        depth: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Option<Vec<u8>>, PageId), HbTrieError> {
        let chunk = self.codec.chunk(key, depth);
        let Some(child) = self.get_child(level_root, &chunk)? else {
            let root = self.put_child(level_root, &chunk, &ChildRef::Value(value.to_vec()))?;
            return Ok((None, root));
        };

        if self.codec.is_terminal(&chunk) {
            return match child {
                ChildRef::Value(old) => {
                    let root =
                        self.put_child(level_root, &chunk, &ChildRef::Value(value.to_vec()))?;
                    Ok((Some(old), root))
                }
                other => Err(terminal_corruption(&other)),
            };
        }

        let offset = (depth + 1) * self.codec.chunk_size();
        let suffix = &key[offset..];
        match child {
            ChildRef::Value(existing) => {
                let existing_key = self.resolver.resolve_key(&existing)?;
                if !self.codec.shares_chunks(&existing_key, key, depth + 1) {
                    return Err(HbTrieError::ResolverMismatch);
                }
                if existing_key == key {
                    let root =
                        self.put_child(level_root, &chunk, &ChildRef::Value(value.to_vec()))?;
                    return Ok((Some(existing), root));
                }

                let tails = vec![
                    Tail::new(existing_key[offset..].to_vec(), existing),
                    Tail::new(suffix.to_vec(), value.to_vec()),
                ];
                let group = self.build_group(depth, tails)?;
                let root = self.put_child(level_root, &chunk, &group)?;
                Ok((None, root))
            }
            ChildRef::SubLevel { root } => {
                let (old, new_root) = self.insert_level(root, depth + 1, key, value)?;
                if new_root == root {
                    return Ok((old, level_root));
                }
                let level_root =
                    self.put_child(level_root, &chunk, &ChildRef::SubLevel { root: new_root })?;
                Ok((old, level_root))
            }
            ChildRef::Meta(mut tails) => {
                match tails.binary_search_by(|tail| tail.suffix.as_slice().cmp(suffix)) {
                    Ok(index) => {
                        let old = std::mem::replace(&mut tails[index].value, value.to_vec());
                        let root = self.put_child(level_root, &chunk, &ChildRef::Meta(tails))?;
                        Ok((Some(old), root))
                    }
                    Err(index) => {
                        tails.insert(index, Tail::new(suffix.to_vec(), value.to_vec()));
                        let group = self.build_group(depth, tails)?;
                        let root = self.put_child(level_root, &chunk, &group)?;
                        Ok((None, root))
                    }
                }
            }
            ChildRef::LeafTree { root } => {
                let mut leaf_tree = BTree::open(self.blocks, root);
                let old = leaf_tree.insert(suffix, value)?;
                let new_root = leaf_tree.root_page();
                if new_root == root {
                    return Ok((old, level_root));
                }
                let level_root =
                    self.put_child(level_root, &chunk, &ChildRef::LeafTree { root: new_root })?;
                Ok((old, level_root))
            }
        }
    }

    /// Remove from the level rooted at `level_root`, which sits at `depth`.
    ///
    /// Returns the removed value and the level's root.
    pub(super) fn remove_level(
        &mut self,
        level_root: PageId,
        depth: usize,
        key: &[u8],
    ) -> Result<(Vec<u8>, PageId), HbTrieError> {
        let chunk = self.codec.chunk(key, depth);
        let child = self
            .get_child(level_root, &chunk)?
            .ok_or(HbTrieError::KeyNotFound)?;

        if self.codec.is_terminal(&chunk) {
            return match child {
                ChildRef::Value(old) => {
                    BTree::open(self.blocks, level_root).remove(&chunk)?;
                    Ok((old, level_root))
                }
                other => Err(terminal_corruption(&other)),
            };
        }

        let suffix = &key[(depth + 1) * self.codec.chunk_size()..];
        match child {
            ChildRef::Value(value) => {
                self.confirm_key(&value, key, depth)?;
                BTree::open(self.blocks, level_root).remove(&chunk)?;
                Ok((value, level_root))
            }
            ChildRef::SubLevel { root } => {
                let (old, new_root) = self.remove_level(root, depth + 1, key)?;
                let level_root = self.normalize(
                    level_root,
                    depth,
                    &chunk,
                    &ChildRef::SubLevel { root: new_root },
                )?;
                Ok((old, level_root))
            }
            ChildRef::Meta(mut tails) => {
                let index = tails
                    .binary_search_by(|tail| tail.suffix.as_slice().cmp(suffix))
                    .map_err(|_| HbTrieError::KeyNotFound)?;
                let removed = tails.remove(index);
                let child = if tails.len() == 1 {
                    ChildRef::Value(tails.remove(0).value)
                } else {
                    ChildRef::Meta(tails)
                };
                let level_root = self.put_child(level_root, &chunk, &child)?;
                Ok((removed.value, level_root))
            }
            ChildRef::LeafTree { root } => {
                let old = BTree::open(self.blocks, root)
                    .remove(suffix)?
                    .ok_or(HbTrieError::KeyNotFound)?;
                let level_root =
                    self.normalize(level_root, depth, &chunk, &ChildRef::LeafTree { root })?;
                Ok((old, level_root))
            }
        }
    }

    /// Build the child reference for a group under a level at `depth`.
    ///
    /// Each tail's suffix is the key below the group's chunk. Suffixes are
    /// unique and never empty.
    pub(super) fn build_group(
        &mut self,
        depth: usize,
        mut tails: Vec<Tail>,
    ) -> Result<ChildRef, HbTrieError> {
        tails.sort_by(|a, b| a.suffix.cmp(&b.suffix));

        if tails.len() == 1 {
            return Ok(ChildRef::Value(tails.remove(0).value));
        }
        if self.config.compact && meta_fits(&tails) {
            return Ok(ChildRef::Meta(tails));
        }

        let limit = self.config.leaf_height_limit;
        if limit > 0 && depth + 1 >= limit {
            let mut leaf_tree = BTree::create(self.blocks)?;
            for tail in &tails {
                leaf_tree.insert(&tail.suffix, &tail.value)?;
            }
            tracing::debug!(
                "flattened {} keys at depth {depth} into leaf tree {}",
                tails.len(),
                leaf_tree.root_page()
            );
            return Ok(ChildRef::LeafTree {
                root: leaf_tree.root_page(),
            });
        }

        let chunk_size = self.codec.chunk_size();
        let mut partitions: BTreeMap<Vec<u8>, Vec<Tail>> = BTreeMap::new();
        for tail in tails {
            partitions
                .entry(self.codec.chunk(&tail.suffix, 0))
                .or_default()
                .push(tail);
        }

        let mut level_root = BTree::create(self.blocks)?.root_page();
        tracing::debug!(
            "split group at depth {depth} into sub-level {level_root} of {} chunks",
            partitions.len()
        );
        for (chunk, mut group) in partitions {
            let child = if group.len() == 1 {
                ChildRef::Value(group.remove(0).value)
            } else {
                let stripped = group
                    .into_iter()
                    .map(|tail| Tail::new(tail.suffix[chunk_size..].to_vec(), tail.value))
                    .collect();
                self.build_group(depth + 1, stripped)?
            };
            level_root = self.put_child(level_root, &chunk, &child)?;
        }

        Ok(ChildRef::SubLevel { root: level_root })
    }

    /// Store a sub-level or leaf tree child after a removal below it,
    /// collapsing it when its keys now fit a smaller representation.
    fn normalize(
        &mut self,
        level_root: PageId,
        depth: usize,
        chunk: &[u8],
        child: &ChildRef,
    ) -> Result<PageId, HbTrieError> {
        let mut gather = if self.config.compact {
            Gather {
                tails: Vec::new(),
                bytes: 0,
                max_tails: usize::from(u16::MAX),
                max_bytes: META_SECTION_CAPACITY - META_HEADER_SIZE,
            }
        } else {
            Gather {
                tails: Vec::new(),
                bytes: 0,
                max_tails: 1,
                max_bytes: usize::MAX,
            }
        };

        let offset = (depth + 1) * self.codec.chunk_size();
        let fits = match child {
            ChildRef::SubLevel { root } => self.gather_level(*root, &[], offset, &mut gather)?,
            ChildRef::LeafTree { root } => self.gather_leaf_tree(*root, &[], &mut gather)?,
            ChildRef::Value(_) | ChildRef::Meta(_) => {
                return self.put_child(level_root, chunk, child);
            }
        };
        if !fits {
            return self.put_child(level_root, chunk, child);
        }

        self.destroy_child(child)?;
        if gather.tails.is_empty() {
            tracing::debug!("dropped empty group at depth {depth}");
            BTree::open(self.blocks, level_root).remove(chunk)?;
            return Ok(level_root);
        }

        tracing::debug!(
            "collapsed group of {} keys at depth {depth}",
            gather.tails.len()
        );
        let group = self.build_group(depth, gather.tails)?;
        self.put_child(level_root, chunk, &group)
    }

    /// Collect the tails of every key below a level.
    ///
    /// `prefix` is the key between the group's chunk and this level, and
    /// `offset` where the group's suffixes start in a full key. Returns
    /// `false` as soon as the budget is exceeded.
    fn gather_level(
        &mut self,
        level_root: PageId,
        prefix: &[u8],
        offset: usize,
        gather: &mut Gather,
    ) -> Result<bool, HbTrieError> {
        let mut cursor = BTree::open(self.blocks, level_root).cursor_from(None)?;
        while let Some(entry) = cursor.next_entry(self.blocks)? {
            let mut path = prefix.to_vec();
            path.extend_from_slice(self.codec.chunk_bytes(&entry.key));

            let fits = match ChildRef::decode(&entry.value)? {
                ChildRef::Value(value) if self.codec.is_terminal(&entry.key) => {
                    gather.push(Tail::new(path, value))
                }
                ChildRef::Value(value) => {
                    let key = self.resolver.resolve_key(&value)?;
                    let suffix = key.get(offset..).unwrap_or_default();
                    if !suffix.starts_with(&path) {
                        return Err(HbTrieError::ResolverMismatch);
                    }
                    gather.push(Tail::new(suffix.to_vec(), value))
                }
                ChildRef::Meta(tails) => tails.into_iter().all(|tail| {
                    let mut suffix = path.clone();
                    suffix.extend_from_slice(&tail.suffix);
                    gather.push(Tail::new(suffix, tail.value))
                }),
                ChildRef::SubLevel { root } => self.gather_level(root, &path, offset, gather)?,
                ChildRef::LeafTree { root } => self.gather_leaf_tree(root, &path, gather)?,
            };
            if !fits {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn gather_leaf_tree(
        &mut self,
        root: PageId,
        prefix: &[u8],
        gather: &mut Gather,
    ) -> Result<bool, HbTrieError> {
        let mut cursor = BTree::open(self.blocks, root).cursor_from(None)?;
        while let Some(entry) = cursor.next_entry(self.blocks)? {
            let mut suffix = prefix.to_vec();
            suffix.extend_from_slice(&entry.key);
            if !gather.push(Tail::new(suffix, entry.value)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Release every block of a sub-level or leaf tree.
    fn destroy_child(&mut self, child: &ChildRef) -> Result<(), HbTrieError> {
        match child {
            ChildRef::SubLevel { root } => self.destroy_level(*root),
            ChildRef::LeafTree { root } => {
                BTree::open(self.blocks, *root).destroy()?;
                Ok(())
            }
            ChildRef::Value(_) | ChildRef::Meta(_) => Ok(()),
        }
    }

    fn destroy_level(&mut self, level_root: PageId) -> Result<(), HbTrieError> {
        let mut cursor = BTree::open(self.blocks, level_root).cursor_from(None)?;
        while let Some(entry) = cursor.next_entry(self.blocks)? {
            let child = ChildRef::decode(&entry.value)?;
            self.destroy_child(&child)?;
        }
        drop(cursor);
        BTree::open(self.blocks, level_root).destroy()?;
        Ok(())
    }
}
