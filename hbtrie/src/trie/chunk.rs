//! Key chunking.
//!
//! A key is consumed `chunk_size` bytes per trie level. Each chunk is stored
//! as a chunk key of `chunk_size + 1` bytes: the chunk's bytes padded with
//! zeroes, then one occupancy byte. A chunk followed by more key bytes has
//! occupancy `chunk_size + 1`; the last chunk of a key has occupancy equal
//! to the number of bytes it holds. With this encoding a key always sorts
//! before its extensions, and comparing chunk keys compares raw keys.

#![allow(clippy::cast_possible_truncation)]

/// Splits keys into chunk keys and joins them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    chunk_size: usize,
}

impl ChunkCodec {
    /// Create a codec. `chunk_size` must be in `1..=MAX_CHUNK_SIZE`.
    #[must_use]
    pub const fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Encoded size of one chunk key.
    #[must_use]
    pub const fn chunk_key_size(&self) -> usize {
        self.chunk_size + 1
    }

    /// Number of chunks of a key of `len` bytes. The empty key has one.
    #[must_use]
    pub const fn chunk_count(&self, len: usize) -> usize {
        if len == 0 {
            1
        } else {
            len.div_ceil(self.chunk_size)
        }
    }

    /// The raw bytes and occupancy of chunk `index`, if the key has it.
    #[must_use]
    pub fn chunk_parts<'k>(&self, key: &'k [u8], index: usize) -> Option<(&'k [u8], u8)> {
        if index >= self.chunk_count(key.len()) {
            return None;
        }
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(key.len());
        let occupancy = if key.len() > start + self.chunk_size {
            self.chunk_size + 1
        } else {
            end - start
        };
        Some((&key[start..end], occupancy as u8))
    }

    /// The chunk key for chunk `index` of `key`.
    ///
    /// An index past the key's last chunk yields the empty terminal chunk.
    #[must_use]
    pub fn chunk(&self, key: &[u8], index: usize) -> Vec<u8> {
        let (bytes, occupancy) = self.chunk_parts(key, index).unwrap_or((&[], 0));
        let mut chunk = Vec::with_capacity(self.chunk_key_size());
        chunk.extend_from_slice(bytes);
        chunk.resize(self.chunk_size, 0);
        chunk.push(occupancy);
        chunk
    }

    /// Whether a chunk key is the last chunk of its key.
    #[must_use]
    pub fn is_terminal(&self, chunk: &[u8]) -> bool {
        chunk
            .last()
            .is_some_and(|&occupancy| usize::from(occupancy) <= self.chunk_size)
    }

    /// The raw key bytes a chunk key carries.
    #[must_use]
    pub fn chunk_bytes<'c>(&self, chunk: &'c [u8]) -> &'c [u8] {
        let Some((&occupancy, bytes)) = chunk.split_last() else {
            return &[];
        };
        let len = usize::from(occupancy).min(self.chunk_size).min(bytes.len());
        &bytes[..len]
    }

    /// Whether two keys agree on their first `count` chunks.
    #[must_use]
    pub fn shares_chunks(&self, a: &[u8], b: &[u8], count: usize) -> bool {
        (0..count).all(|index| {
            match (self.chunk_parts(a, index), self.chunk_parts(b, index)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        })
    }

    /// Concatenate every chunk key of `key`.
    #[must_use]
    pub fn reform(&self, key: &[u8]) -> Vec<u8> {
        let count = self.chunk_count(key.len());
        let mut reformed = Vec::with_capacity(count * self.chunk_key_size());
        for index in 0..count {
            reformed.extend_from_slice(&self.chunk(key, index));
        }
        reformed
    }

    /// Invert [`reform`](Self::reform). Returns `None` for malformed input.
    #[must_use]
    pub fn deform(&self, reformed: &[u8]) -> Option<Vec<u8>> {
        let size = self.chunk_key_size();
        if reformed.is_empty() || reformed.len() % size != 0 {
            return None;
        }

        let chunks: Vec<&[u8]> = reformed.chunks(size).collect();
        let mut key = Vec::with_capacity(chunks.len() * self.chunk_size);
        for (index, chunk) in chunks.iter().enumerate() {
            let last = index + 1 == chunks.len();
            if self.is_terminal(chunk) != last {
                return None;
            }
            if !last && usize::from(chunk[self.chunk_size]) != size {
                return None;
            }
            let bytes = self.chunk_bytes(chunk);
            if chunk[bytes.len()..self.chunk_size].iter().any(|&b| b != 0) {
                return None;
            }
            // Only the empty key may end in an empty chunk
            if last && bytes.is_empty() && index > 0 {
                return None;
            }
            key.extend_from_slice(bytes);
        }
        Some(key)
    }
}
