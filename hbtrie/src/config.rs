//! Trie and block store configuration.
//!
//! Both configurations have sensible defaults and can be loaded from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `HBTRIE_CHUNK_SIZE`: Bytes of key consumed per trie level (default: `8`)
//! - `HBTRIE_VALUE_SIZE`: Size of every stored value record (default: `8`)
//! - `HBTRIE_COMPACT`: Enable meta-section compaction, `true`/`false` (default: `false`)
//! - `HBTRIE_LEAF_HEIGHT_LIMIT`: Level depth at which key groups flatten into
//!   leaf trees, `0` disables (default: `0`)
//! - `HBTRIE_CACHE_BLOCKS`: Clean blocks kept in the block cache (default: `1024`)
//!
//! # Invariants
//!
//! - `chunk_size` is in `1..=MAX_CHUNK_SIZE`
//! - `value_size` is in `1..=MAX_VALUE_SIZE`

/// Largest supported chunk size in bytes.
pub const MAX_CHUNK_SIZE: usize = 128;

/// Largest supported value record size in bytes.
pub const MAX_VALUE_SIZE: usize = 64;

/// Parameters fixed for the lifetime of one trie.
///
/// `compact` and `leaf_height_limit` may still be changed through the trie
/// setters until the first structural mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieConfig {
    /// Bytes of key consumed per trie level.
    pub chunk_size: usize,
    /// Size of every value record (typically a document log offset).
    pub value_size: usize,
    /// Keep small key groups inline as meta-sections.
    pub compact: bool,
    /// Depth at which key groups flatten into a leaf tree. `0` disables.
    pub leaf_height_limit: usize,
}

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TrieConfig {
    fn default() -> Self {
        Self {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            value_size: Self::DEFAULT_VALUE_SIZE,
            compact: false,
            leaf_height_limit: 0,
        }
    }
}

impl TrieConfig {
    /// Default chunk size.
    pub const DEFAULT_CHUNK_SIZE: usize = 8;
    /// Default value size (one little-endian u64 document offset).
    pub const DEFAULT_VALUE_SIZE: usize = 8;

    /// Build a configuration with the given chunk and value sizes and no
    /// skew optimizations.
    pub fn new(chunk_size: usize, value_size: usize) -> Result<Self, ConfigError> {
        let config = Self {
            chunk_size,
            value_size,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every field is in its supported range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidValue {
                name: "chunk_size".to_string(),
                message: format!("{} is not in 1..={MAX_CHUNK_SIZE}", self.chunk_size),
            });
        }
        if self.value_size == 0 || self.value_size > MAX_VALUE_SIZE {
            return Err(ConfigError::InvalidValue {
                name: "value_size".to_string(),
                message: format!("{} is not in 1..={MAX_VALUE_SIZE}", self.value_size),
            });
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            chunk_size: parse_var(&lookup, "HBTRIE_CHUNK_SIZE", defaults.chunk_size)?,
            value_size: parse_var(&lookup, "HBTRIE_VALUE_SIZE", defaults.value_size)?,
            compact: parse_var(&lookup, "HBTRIE_COMPACT", defaults.compact)?,
            leaf_height_limit: parse_var(
                &lookup,
                "HBTRIE_LEAF_HEIGHT_LIMIT",
                defaults.leaf_height_limit,
            )?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Block store tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Number of clean blocks kept in memory. `0` disables caching.
    pub cache_blocks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_blocks: Self::DEFAULT_CACHE_BLOCKS,
        }
    }
}

impl StoreConfig {
    /// Default block cache capacity (4MB of 4KB blocks).
    pub const DEFAULT_CACHE_BLOCKS: usize = 1024;

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            cache_blocks: parse_var(&lookup, "HBTRIE_CACHE_BLOCKS", Self::DEFAULT_CACHE_BLOCKS)?,
        })
    }
}

/// Parse one variable, falling back to `default` when it is unset.
fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' could not be parsed"),
            }),
        None => Ok(default),
    }
}
