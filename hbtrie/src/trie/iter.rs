//! Ordered iteration over a trie.
//!
//! The iterator keeps one B+tree cursor per trie level it is inside, each
//! with the key bytes consumed above that level, plus the key group it is
//! currently draining: a single value, a meta-section or a leaf tree.
//! Chunk keys sort like raw keys, so walking every level in order yields keys
//! in order.

use crate::storage::PageId;
use crate::storage::btree::{BTree, BTreeCursor};
use crate::trie::child::{ChildRef, Tail};
use crate::trie::error::HbTrieError;
use crate::trie::resolver::KeyResolver;
use crate::trie::{HbTrie, terminal_corruption};

/// One trie level being walked.
struct LevelFrame {
    cursor: BTreeCursor,
    /// Key bytes consumed by the levels above.
    prefix: Vec<u8>,
}

/// Entries of one group, handed out before the level cursors move on.
enum Pending {
    /// `key` is `None` until the resolver is asked for it.
    Value {
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    },
    Meta {
        prefix: Vec<u8>,
        tails: Vec<Tail>,
        index: usize,
    },
    Leaf {
        prefix: Vec<u8>,
        cursor: BTreeCursor,
    },
}

/// Iterator over a trie's (key, value) pairs in key order.
///
/// Every open cursor is released when the iterator is dropped or
/// [`free`](Self::free)d. Once it runs out, or hits a fatal error, every
/// further call fails with [`HbTrieError::IteratorExhausted`].
pub struct HbTrieIterator<'t, 'a, R: KeyResolver> {
    trie: &'t mut HbTrie<'a, R>,
    frames: Vec<LevelFrame>,
    pending: Option<Pending>,
    exhausted: bool,
}

impl<'t, 'a, R: KeyResolver> HbTrieIterator<'t, 'a, R> {
    pub(super) fn new(
        trie: &'t mut HbTrie<'a, R>,
        start: Option<&[u8]>,
    ) -> Result<Self, HbTrieError> {
        let root = trie.root;
        let mut iter = Self {
            trie,
            frames: Vec::new(),
            pending: None,
            exhausted: false,
        };
        if root == 0 {
            return Ok(iter);
        }

        match start {
            Some(start) => iter.seek(root, start)?,
            None => {
                let cursor = BTree::open(iter.trie.blocks, root).cursor_from(None)?;
                iter.frames.push(LevelFrame {
                    cursor,
                    prefix: Vec::new(),
                });
            }
        }
        Ok(iter)
    }

    /// The next (key, value) pair.
    pub fn next_entry(&mut self) -> Result<(Vec<u8>, Vec<u8>), HbTrieError> {
        self.step(true)
    }

    /// The next value, without rebuilding or resolving its key.
    pub fn next_value_only(&mut self) -> Result<Vec<u8>, HbTrieError> {
        self.step(false).map(|(_, value)| value)
    }

    /// Release the iterator and its cursors.
    pub fn free(self) {
        tracing::trace!("freeing iterator with {} open levels", self.frames.len());
    }

    /// B+tree cursors open in the trie's block group.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.trie.blocks.open_cursors()
    }

    fn step(&mut self, with_key: bool) -> Result<(Vec<u8>, Vec<u8>), HbTrieError> {
        if self.exhausted {
            return Err(HbTrieError::IteratorExhausted);
        }
        match self.advance(with_key) {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => {
                self.finish();
                Err(HbTrieError::IteratorExhausted)
            }
            Err(e) => {
                tracing::warn!("iterator stopped: {e}");
                self.finish();
                Err(e)
            }
        }
    }

    fn finish(&mut self) {
        self.frames.clear();
        self.pending = None;
        self.exhausted = true;
    }

    /// Produce the next entry. The key is left empty unless `with_key`.
    fn advance(&mut self, with_key: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>, HbTrieError> {
        loop {
            if let Some(entry) = self.take_pending(with_key)? {
                return Ok(Some(entry));
            }

            let Some(frame) = self.frames.last_mut() else {
                return Ok(None);
            };
            let Some(entry) = frame.cursor.next_entry(self.trie.blocks)? else {
                self.frames.pop();
                continue;
            };

            let mut path = frame.prefix.clone();
            path.extend_from_slice(self.trie.codec.chunk_bytes(&entry.key));
            let terminal = self.trie.codec.is_terminal(&entry.key);

            match ChildRef::decode(&entry.value)? {
                ChildRef::SubLevel { root } if !terminal => {
                    let cursor = BTree::open(self.trie.blocks, root).cursor_from(None)?;
                    self.frames.push(LevelFrame {
                        cursor,
                        prefix: path,
                    });
                }
                ChildRef::Value(value) => {
                    self.pending = Some(Pending::Value {
                        key: terminal.then_some(path),
                        value,
                    });
                }
                ChildRef::Meta(tails) if !terminal => {
                    self.pending = Some(Pending::Meta {
                        prefix: path,
                        tails,
                        index: 0,
                    });
                }
                ChildRef::LeafTree { root } if !terminal => {
                    self.pending = Some(self.leaf_pending(root, path, None)?);
                }
                other => return Err(terminal_corruption(&other)),
            }
        }
    }

    /// Hand out the next entry of the pending group, if any is left.
    fn take_pending(&mut self, with_key: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>, HbTrieError> {
        match self.pending.take() {
            None => Ok(None),
            Some(Pending::Value { key, value }) => {
                let key = match key {
                    Some(key) if with_key => key,
                    None if with_key => self.trie.resolver.resolve_key(&value)?,
                    _ => Vec::new(),
                };
                Ok(Some((key, value)))
            }
            Some(Pending::Meta {
                prefix,
                mut tails,
                index,
            }) => {
                let Some(tail) = tails.get_mut(index) else {
                    return Ok(None);
                };
                let value = std::mem::take(&mut tail.value);
                let key = if with_key {
                    concat(&prefix, &tail.suffix)
                } else {
                    Vec::new()
                };
                self.pending = Some(Pending::Meta {
                    prefix,
                    tails,
                    index: index + 1,
                });
                Ok(Some((key, value)))
            }
            Some(Pending::Leaf { prefix, mut cursor }) => {
                let Some(entry) = cursor.next_entry(self.trie.blocks)? else {
                    return Ok(None);
                };
                let key = if with_key {
                    concat(&prefix, &entry.key)
                } else {
                    Vec::new()
                };
                self.pending = Some(Pending::Leaf { prefix, cursor });
                Ok(Some((key, entry.value)))
            }
        }
    }

    fn leaf_pending(
        &mut self,
        root: PageId,
        prefix: Vec<u8>,
        start: Option<&[u8]>,
    ) -> Result<Pending, HbTrieError> {
        let cursor = BTree::open(self.trie.blocks, root).cursor_from(start)?;
        Ok(Pending::Leaf { prefix, cursor })
    }

    /// Position at the first key `>= start`.
    ///
    /// Each level gets a cursor at the first chunk `>= start`'s chunk. On an
    /// exact match the cursor is moved past it and the matching entry decides
    /// what comes first: a sub-level is searched the same way, a key group is
    /// positioned inside.
    fn seek(&mut self, root: PageId, start: &[u8]) -> Result<(), HbTrieError> {
        let chunk_size = self.trie.codec.chunk_size();
        let mut level = root;
        let mut prefix = Vec::new();

        for depth in 0..self.trie.codec.chunk_count(start.len()) {
            let chunk = self.trie.codec.chunk(start, depth);
            let mut cursor = BTree::open(self.trie.blocks, level).cursor_from(Some(&chunk))?;
            let exact = match cursor.peek_entry(self.trie.blocks)? {
                Some(entry) if entry.key == chunk => Some(ChildRef::decode(&entry.value)?),
                _ => None,
            };
            let Some(child) = exact else {
                self.frames.push(LevelFrame { cursor, prefix });
                return Ok(());
            };
            cursor.next_entry(self.trie.blocks)?;

            let path = concat(&prefix, self.trie.codec.chunk_bytes(&chunk));
            self.frames.push(LevelFrame { cursor, prefix });

            if self.trie.codec.is_terminal(&chunk) {
                return match child {
                    ChildRef::Value(value) => {
                        self.pending = Some(Pending::Value {
                            key: Some(path),
                            value,
                        });
                        Ok(())
                    }
                    other => Err(terminal_corruption(&other)),
                };
            }

            let suffix = &start[(depth + 1) * chunk_size..];
            match child {
                ChildRef::SubLevel { root } => {
                    level = root;
                    prefix = path;
                }
                ChildRef::Value(value) => {
                    let key = self.trie.resolver.resolve_key(&value)?;
                    if key.as_slice() >= start {
                        self.pending = Some(Pending::Value {
                            key: Some(key),
                            value,
                        });
                    }
                    return Ok(());
                }
                ChildRef::Meta(tails) => {
                    let index = tails.partition_point(|tail| tail.suffix.as_slice() < suffix);
                    self.pending = Some(Pending::Meta {
                        prefix: path,
                        tails,
                        index,
                    });
                    return Ok(());
                }
                ChildRef::LeafTree { root } => {
                    self.pending = Some(self.leaf_pending(root, path, Some(suffix))?);
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

impl<R: KeyResolver> Iterator for HbTrieIterator<'_, '_, R> {
    type Item = Result<(Vec<u8>, Vec<u8>), HbTrieError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Err(HbTrieError::IteratorExhausted) => None,
            other => Some(other),
        }
    }
}

fn concat(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}
