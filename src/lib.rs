//! # prefixdb
//!
//! A lightweight, embedded, single-file ordered key-value store built on an
//! on-disk radix trie.
//!
//! ## Features
//!
//! - **Binary keys and values**: arbitrary byte sequences
//! - **Ordered**: prefix enumeration yields keys in lexicographic order
//! - **Best-prefix match**: O(m) walk reporting the deepest value on a path
//! - **Single file**: the whole trie lives in one growable file behind a
//!   write-back page cache
//! - **Explicit durability**: nothing reaches the file until `flush`
//!
//! ## Quick Start
//!
//! ```rust
//! use prefixdb::{PrefixDb, Result};
//!
//! fn main() -> Result<()> {
//!     // Create an in-memory database
//!     let db = PrefixDb::open_memory()?;
//!
//!     // Insert data
//!     db.insert(b"user:alice", b"Alice Smith")?;
//!     db.insert(b"user:bob", b"Bob Jones")?;
//!
//!     // Retrieve data
//!     let value = db.get(b"user:alice")?;
//!     assert_eq!(value, Some(b"Alice Smith".to_vec()));
//!
//!     // Prefix search, in key order
//!     let users = db.starts_with(b"user:")?;
//!     assert_eq!(users.len(), 2);
//!     assert_eq!(users[0].0, b"user:alice");
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Persistence
//!
//! ```rust,no_run
//! use prefixdb::{PrefixDb, Config, Result};
//!
//! fn main() -> Result<()> {
//!     // Open with file persistence
//!     let config = Config::default();
//!     let db = PrefixDb::open("mydb.dat", config)?;
//!
//!     db.insert(b"key", b"value")?;
//!     db.flush()?;  // Ensure data is persisted
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod error;
pub mod schema;
pub mod storage;
pub mod trie;

pub use cache::PageCache;
pub use error::{Error, Result};
pub use schema::Schema;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use trie::{Match, Row, Trie};

use parking_lot::RwLock;
use std::path::Path;

use log::{debug, info, warn};


/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum key length in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Maximum value size (256 MB)
pub const MAX_VALUE_SIZE: usize = 256 * 1024 * 1024;

/// Configuration for a database or trie handle
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of cache pages in bytes (default: 8192)
    pub page_size: usize,

    /// Maximum number of entries in the key lookup cache (default: 10000)
    pub cache_size: usize,

    /// Enable memory-mapped reads for file storage (default: true)
    pub use_mmap: bool,

    /// Verify each written record by reading it back (default: false)
    pub consistency_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: cache::DEFAULT_PAGE_SIZE,
            cache_size: 10000,
            use_mmap: true,
            consistency_check: false,
        }
    }
}

/// Lookup cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The main prefixdb database handle
///
/// A validated facade over [`Trie`]. Reads take a shared lock and writes an
/// exclusive one, so the handle can be shared between threads.
pub struct PrefixDb {
    trie: RwLock<Trie<Box<dyn Storage>>>,
}

impl PrefixDb {
    /// Open a database file
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use prefixdb::{PrefixDb, Config};
    ///
    /// let db = PrefixDb::open("mydb.dat", Config::default()).unwrap();
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        info!("Opening PrefixDb at {:?}", path.as_ref());
        let storage: Box<dyn Storage> = Box::new(FileStorage::open(path, config.use_mmap)?);
        Ok(Self {
            trie: RwLock::new(Trie::open(storage, &config)?),
        })
    }

    /// Create an in-memory database (no persistence)
    ///
    /// # Example
    ///
    /// ```rust
    /// use prefixdb::PrefixDb;
    ///
    /// let db = PrefixDb::open_memory().unwrap();
    /// ```
    pub fn open_memory() -> Result<Self> {
        Self::open_memory_with_config(Config::default())
    }

    /// Create an in-memory database with custom configuration
    pub fn open_memory_with_config(config: Config) -> Result<Self> {
        info!("Opening in-memory PrefixDb");
        let storage: Box<dyn Storage> = Box::new(MemoryStorage::new());
        Ok(Self {
            trie: RwLock::new(Trie::open(storage, &config)?),
        })
    }

    /// Insert or update a key-value pair
    ///
    /// # Arguments
    ///
    /// * `key` - The key (max 1024 bytes)
    /// * `value` - The value (max 256 MB)
    ///
    /// # Example
    ///
    /// ```rust
    /// use prefixdb::PrefixDb;
    ///
    /// let db = PrefixDb::open_memory().unwrap();
    /// db.insert(b"mykey", b"myvalue").unwrap();
    /// ```
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.validate_key(key)?;
        self.validate_value(value)?;
        debug!("Inserting key of {} bytes ({} bytes value)", key.len(), value.len());
        self.trie.write().set(key, value)
    }

    /// Get a value by key
    ///
    /// Returns `None` if the key doesn't exist.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.validate_key(key)?;
        self.trie.read().get(key)
    }

    /// Check if a key exists
    ///
    /// More efficient than `get()` as it doesn't read the value.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.validate_key(key)?;
        Ok(self.trie.read().get_row(key)?.is_some())
    }

    /// Collect all key-value pairs whose key starts with `prefix`, in
    /// lexicographic key order.
    pub fn starts_with(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if prefix.len() > MAX_KEY_LEN {
            return Err(Error::InvalidInput(format!(
                "Prefix too long: {} bytes (max {})",
                prefix.len(),
                MAX_KEY_LEN
            )));
        }
        let trie = self.trie.read();
        let mut results = Vec::new();
        for row in trie.start_with(prefix)? {
            let row = row?;
            let value = trie.read_value(&row)?;
            results.push((row.key, value));
        }
        Ok(results)
    }

    /// Walk `needle` as deep as the trie allows and report whether the walk
    /// landed on a value.
    pub fn best_match(&self, needle: &[u8]) -> Result<Match> {
        self.trie.read().best_match(needle)
    }

    /// Number of records in the database
    pub fn len(&self) -> u64 {
        self.trie.read().record_count()
    }

    /// Check if the database is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enable the in-memory key lookup cache
    pub fn activate_cache(&self) {
        self.trie.read().activate_cache();
    }

    /// Lookup cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.trie.read().cache_stats()
    }

    /// Enable or disable read-back verification after each write
    pub fn set_consistency_check(&self, enabled: bool) {
        self.trie.read().set_consistency_check(enabled);
    }

    /// Flush all pending writes to the backing storage
    ///
    /// This is automatically attempted on drop, but can be called manually
    /// to ensure durability at specific points.
    pub fn flush(&self) -> Result<()> {
        debug!("Flushing database");
        self.trie.read().flush()
    }

    // Validation helpers

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("Key cannot be empty".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidInput(format!(
                "Key too long: {} bytes (max {})",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(())
    }

    fn validate_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::InvalidInput(format!(
                "Value too large: {} bytes (max {})",
                value.len(),
                MAX_VALUE_SIZE
            )));
        }
        Ok(())
    }
}

impl Drop for PrefixDb {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush on drop: {}", e);
        }
    }
}
