//! Turning stored values back into keys.
//!
//! Trie levels only keep the chunks a key needs to be told apart from its
//! neighbors. Whenever the trie needs the full key behind a value it asks a
//! [`KeyResolver`].

use std::sync::Arc;

use crate::storage::DocLog;

/// Maps a stored value record to the full key it was inserted with.
pub trait KeyResolver {
    fn resolve_key(&self, value: &[u8]) -> Result<Vec<u8>, ResolveError>;
}

impl<T: KeyResolver + ?Sized> KeyResolver for &T {
    fn resolve_key(&self, value: &[u8]) -> Result<Vec<u8>, ResolveError> {
        (**self).resolve_key(value)
    }
}

impl<T: KeyResolver + ?Sized> KeyResolver for Arc<T> {
    fn resolve_key(&self, value: &[u8]) -> Result<Vec<u8>, ResolveError> {
        (**self).resolve_key(value)
    }
}

/// Values are little-endian document offsets; the key is read from the
/// document at that offset.
impl KeyResolver for DocLog {
    fn resolve_key(&self, value: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let offset = read_reference(value)?;
        self.read_key(offset)
            .map_err(|e| ResolveError::Unavailable {
                reference: offset,
                reason: e.to_string(),
            })
    }
}

/// Read the little-endian u64 at the start of a value record.
pub fn read_reference(value: &[u8]) -> Result<u64, ResolveError> {
    value
        .get(..8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(ResolveError::InvalidReference(value.len()))
}

/// Errors returned by a key resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The value is too short to hold a reference.
    InvalidReference(usize),
    /// Nothing usable is stored under the reference.
    Unavailable { reference: u64, reason: String },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidReference(len) => {
                write!(f, "value of {len} bytes holds no key reference")
            }
            Self::Unavailable { reference, reason } => {
                write!(f, "no key for reference {reference}: {reason}")
            }
        }
    }
}

impl std::error::Error for ResolveError {}
