use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::storage::btree::BTreeError;
use crate::trie::resolver::ResolveError;

/// Errors returned by trie operations.
#[derive(Debug)]
pub enum HbTrieError {
    /// The key is not in the trie.
    KeyNotFound,
    /// The iterator has no more entries.
    IteratorExhausted,
    /// A stored structure could not be decoded.
    Corruption(String),
    /// The resolver returned a key that cannot live where its value was found.
    ResolverMismatch,
    /// The key exceeds `MAX_KEY_LEN`.
    KeyTooLong(usize),
    /// The value does not have the configured value size.
    InvalidValueSize { expected: usize, actual: usize },
    /// Flags can no longer change once the trie has been mutated.
    FlagsFrozen,
    /// Invalid configuration.
    Config(ConfigError),
    /// B+tree error in a trie level or leaf tree.
    Block(BTreeError),
    /// Block store error outside any B+tree.
    Storage(StorageError),
    /// The resolver could not produce a key.
    Resolve(ResolveError),
}

impl HbTrieError {
    /// Whether the error means the trie or its storage is in trouble, as
    /// opposed to a missing key or a bad argument.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corruption(_)
                | Self::ResolverMismatch
                | Self::Block(_)
                | Self::Storage(_)
                | Self::Resolve(_)
        )
    }
}

impl std::fmt::Display for HbTrieError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyNotFound => write!(f, "key not found"),
            Self::IteratorExhausted => write!(f, "iterator exhausted"),
            Self::Corruption(msg) => write!(f, "trie corruption: {msg}"),
            Self::ResolverMismatch => {
                write!(f, "resolved key does not match its position in the trie")
            }
            Self::KeyTooLong(len) => write!(f, "key of {len} bytes is too long"),
            Self::InvalidValueSize { expected, actual } => {
                write!(f, "value is {actual} bytes, expected {expected}")
            }
            Self::FlagsFrozen => write!(f, "trie flags cannot change after the first insert"),
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Block(e) => write!(f, "block error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Resolve(e) => write!(f, "resolve error: {e}"),
        }
    }
}

impl std::error::Error for HbTrieError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Block(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Resolve(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for HbTrieError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<BTreeError> for HbTrieError {
    fn from(e: BTreeError) -> Self {
        Self::Block(e)
    }
}

impl From<StorageError> for HbTrieError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ResolveError> for HbTrieError {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}
