//! respcache - Pluggable Response Cache for Inference Servers
//!
//! Stores inference responses (entries made of items of host-memory
//! buffers) under caller-chosen keys, either in a fixed-size in-process
//! arena with LRU eviction or in Redis hashes.
//!
//! # Architecture
//!
//! ```text
//! Entry → codec (field record) → StoreAdapter → FieldStore (arena | redis)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Entry model, codec, adapter and backing stores
//! - [`config`] - JSON option parsing
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```
//! use respcache::cache::{Buffer, Entry, Item, ResponseCache};
//!
//! let cache = ResponseCache::local(1 << 20);
//! let entry = Entry::from_items(vec![Item::from_buffers(vec![Buffer::new(&b"output"[..])])]);
//! cache.insert("request-hash", &entry).unwrap();
//! assert_eq!(cache.lookup("request-hash").unwrap(), entry);
//! ```

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{Buffer, Entry, EntrySink, EntrySource, Item, MemoryKind, ResponseCache};
pub use config::{BackendKind, CacheConfig};
pub use error::{Error, ErrorKind, Result};
