//! sediment-store: an embedded, transactional key-value storage core.
//!
//! sediment-store persists ordered byte-string keys mapped to byte-string
//! values (optionally multi-valued) in an append-only log of fixed-size
//! segment files:
//!
//! - **Append-only log**: fixed-size pages with XXH3-64 trailer hashes,
//!   single-writer windows, consistent crash recovery by truncation past
//!   the last committed root
//! - **Page cache**: shared or per-log, generational clock eviction,
//!   verification and decryption on fill
//! - **Index trees**: a B+-like tree and a Patricia (radix) tree persisted
//!   as DAGs of log records ending in an atomically-committed root
//! - **Reclaim**: still-live records are copied forward so old segments
//!   can be dropped
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Index Trees                  │
//! │   (B+-tree / Patricia, COW mutation, save)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │                    Log                       │
//! │  (records, write windows, recovery, files)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │                Page Cache                    │
//! │      (verify + decrypt on fill, evict)      │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              Data Backend                    │
//! │      (FileData* / MemoryStorage)            │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use sediment_store::log::backend::{FileDataReader, FileDataWriter};
//! use sediment_store::log::{Log, LogConfig};
//! use sediment_store::tree::btree::{BTree, BTreeMutable};
//! use sediment_store::tree::TreeMutable;
//! use std::sync::Arc;
//!
//! let reader = Box::new(FileDataReader::new("data")?);
//! let writer = Box::new(FileDataWriter::new("data")?);
//! let log = Arc::new(Log::open(reader, writer, LogConfig::default())?);
//!
//! let tree = BTree::empty(Arc::clone(&log), 1, false, Default::default());
//! let mut mutable = BTreeMutable::new(&tree)?;
//! mutable.put(b"key", b"value")?;
//!
//! let mut guard = log.begin_write()?;
//! let root = mutable.save(&mut guard)?;
//! guard.write_database_root(root)?;
//! guard.commit()?;
//! # Ok::<(), sediment_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// B+ tree operations use complex return types for split propagation.
#![allow(clippy::type_complexity)]

pub mod cache;
pub mod cipher;
pub mod error;
pub mod log;
pub mod reclaim;
pub mod tree;
pub mod varint;

// Re-export commonly used types.
pub use cache::{CacheConfig, CacheSizing, PageCache, Semaphore};
pub use cipher::{StreamCipher, StreamCipherProvider};
pub use error::{Address, Error, Result, NULL_ADDRESS};
pub use log::backend::{
    DataReader, DataWriter, FileDataReader, FileDataWriter, MemoryStorage, RemoveBlockKind,
};
pub use log::loggable::Loggable;
pub use log::{BlockListener, Log, LogConfig, ReadBytesListener, WriteGuard};
pub use tree::btree::{BTree, BTreeMutable};
pub use tree::patricia::{PatriciaTree, PatriciaTreeMutable};
pub use tree::{BalancePolicy, ExpiredLoggable, MutableCursor, Tree, TreeCursor, TreeMutable};

/// Store format version.
pub const VERSION: u16 = 1;
