//! Response Cache
//!
//! Pluggable key-value cache for inference responses. An entry (items of
//! host-memory buffers) is flattened into a field record and stored under a
//! caller-chosen key in one of the backing field stores.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ResponseCache                          │
//! │        encode/decode entries  (codec)                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │                       StoreAdapter                           │
//! │   exists / lookup / insert, error mapping, metrics           │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  ArenaFieldStore (local)     │  RedisFieldStore (feature)    │
//! │  PoolArena + LRU eviction    │  one hash per key, r2d2 pool  │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - Only CPU and CPU-pinned buffers with a non-zero size are stored
//! - An insert never overwrites an existing key
//! - A stored record always has a multiple of [`FIELDS_PER_BUFFER`] fields

pub mod adapter;
pub mod arena;
pub mod codec;
pub mod entry;
pub mod local;
mod manager;
pub mod metrics;
#[cfg(feature = "redis")]
pub mod remote;
pub mod store;

#[cfg(test)]
mod proptest;

pub use adapter::{StoreAdapter, StoredEntry};
pub use arena::{PoolArena, Slot};
pub use codec::{decode, decode_into, encode, FieldMap, FORMAT_VERSION};
pub use entry::{
    collect_entry, Buffer, BufferAttributes, Entry, EntrySink, EntrySource, Item, MemoryKind,
};
pub use local::ArenaFieldStore;
pub use manager::ResponseCache;
pub use metrics::{CacheMetrics, MetricsSnapshot};
#[cfg(feature = "redis")]
pub use remote::RedisFieldStore;
pub use store::{FieldStore, InMemoryFieldStore, StoreError, StoreResult, StoreStats};

/// Fields written per buffer: payload, byte size, memory kind, device id
pub const FIELDS_PER_BUFFER: usize = 4;

// =============================================================================
// Tests
// =============================================================================
