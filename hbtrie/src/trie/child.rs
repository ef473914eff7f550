//! Child references stored as trie level entry values.
//!
//! Every entry of a trie level maps a chunk key to one of these, encoded with
//! a leading tag byte:
//!
//! | Tag | Variant    | Payload                                              |
//! |-----|------------|------------------------------------------------------|
//! | 1   | `SubLevel` | u64 root page of the next level                      |
//! | 2   | `Value`    | the value record                                     |
//! | 3   | `Meta`     | u16 count, then per tail: u16 len, suffix, u16 len, value |
//! | 4   | `LeafTree` | u64 root page of the flat suffix tree                |

#![allow(clippy::cast_possible_truncation)]

use crate::storage::PageId;
use crate::trie::error::HbTrieError;

const TAG_SUB_LEVEL: u8 = 1;
const TAG_VALUE: u8 = 2;
const TAG_META: u8 = 3;
const TAG_LEAF_TREE: u8 = 4;

/// Largest encoded size of a meta-section child reference.
pub const META_SECTION_CAPACITY: usize = 1024;

/// Tag byte plus the u16 tail count.
pub const META_HEADER_SIZE: usize = 3;

/// A key below a group's chunk, with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tail {
    pub suffix: Vec<u8>,
    pub value: Vec<u8>,
}

impl Tail {
    #[must_use]
    pub const fn new(suffix: Vec<u8>, value: Vec<u8>) -> Self {
        Self { suffix, value }
    }

    /// Bytes this tail takes inside a meta-section.
    #[must_use]
    pub const fn meta_size(&self) -> usize {
        4 + self.suffix.len() + self.value.len()
    }
}

/// Whether sorted `tails` fit in one meta-section.
#[must_use]
pub fn meta_fits(tails: &[Tail]) -> bool {
    let size: usize = tails.iter().map(Tail::meta_size).sum();
    tails.len() <= usize::from(u16::MAX) && META_HEADER_SIZE + size <= META_SECTION_CAPACITY
}

/// What a chunk of a trie level leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildRef {
    /// Another trie level, keyed by the next chunk.
    SubLevel { root: PageId },
    /// The value of the single key under this chunk.
    Value(Vec<u8>),
    /// Suffix-sorted tails of a small key group, kept inline.
    Meta(Vec<Tail>),
    /// A flat B+tree from suffix to value.
    LeafTree { root: PageId },
}

impl ChildRef {
    /// Serialize to the level entry value.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SubLevel { root } => encode_root(TAG_SUB_LEVEL, *root),
            Self::LeafTree { root } => encode_root(TAG_LEAF_TREE, *root),
            Self::Value(value) => {
                let mut buf = Vec::with_capacity(1 + value.len());
                buf.push(TAG_VALUE);
                buf.extend_from_slice(value);
                buf
            }
            Self::Meta(tails) => {
                let size: usize = tails.iter().map(Tail::meta_size).sum();
                let mut buf = Vec::with_capacity(META_HEADER_SIZE + size);
                buf.push(TAG_META);
                buf.extend_from_slice(&(tails.len() as u16).to_le_bytes());
                for tail in tails {
                    buf.extend_from_slice(&(tail.suffix.len() as u16).to_le_bytes());
                    buf.extend_from_slice(&tail.suffix);
                    buf.extend_from_slice(&(tail.value.len() as u16).to_le_bytes());
                    buf.extend_from_slice(&tail.value);
                }
                buf
            }
        }
    }

    /// Parse a level entry value.
    pub fn decode(bytes: &[u8]) -> Result<Self, HbTrieError> {
        let Some((&tag, payload)) = bytes.split_first() else {
            return Err(HbTrieError::Corruption("empty child reference".to_string()));
        };

        match tag {
            TAG_SUB_LEVEL => Ok(Self::SubLevel {
                root: decode_root(payload)?,
            }),
            TAG_LEAF_TREE => Ok(Self::LeafTree {
                root: decode_root(payload)?,
            }),
            TAG_VALUE => Ok(Self::Value(payload.to_vec())),
            TAG_META => decode_meta(payload).map(Self::Meta),
            other => Err(HbTrieError::Corruption(format!(
                "unknown child reference tag {other}"
            ))),
        }
    }
}

fn encode_root(tag: u8, root: PageId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(tag);
    buf.extend_from_slice(&root.to_le_bytes());
    buf
}

fn decode_root(payload: &[u8]) -> Result<PageId, HbTrieError> {
    let bytes: [u8; 8] = payload.try_into().map_err(|_| {
        HbTrieError::Corruption(format!("child root of {} bytes", payload.len()))
    })?;
    let root = PageId::from_le_bytes(bytes);
    if root == 0 {
        return Err(HbTrieError::Corruption("child root is page 0".to_string()));
    }
    Ok(root)
}

fn decode_meta(payload: &[u8]) -> Result<Vec<Tail>, HbTrieError> {
    let mut reader = MetaReader { payload, offset: 0 };
    let count = reader.read_u16()?;
    let mut tails = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let suffix_len = reader.read_u16()?;
        let suffix = reader.read_bytes(usize::from(suffix_len))?;
        let value_len = reader.read_u16()?;
        let value = reader.read_bytes(usize::from(value_len))?;
        tails.push(Tail::new(suffix, value));
    }
    if reader.offset != payload.len() {
        return Err(HbTrieError::Corruption(format!(
            "{} trailing bytes after meta-section",
            payload.len() - reader.offset
        )));
    }
    Ok(tails)
}

struct MetaReader<'p> {
    payload: &'p [u8],
    offset: usize,
}

impl MetaReader<'_> {
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, HbTrieError> {
        let end = self.offset + len;
        let bytes = self.payload.get(self.offset..end).ok_or_else(|| {
            HbTrieError::Corruption(format!("meta-section truncated at byte {}", self.offset))
        })?;
        self.offset = end;
        Ok(bytes.to_vec())
    }

    fn read_u16(&mut self) -> Result<u16, HbTrieError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}
