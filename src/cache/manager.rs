//! Response Cache
//!
//! Entry-level front door: encodes entries into field records, hands them to
//! the [`StoreAdapter`] and decodes them on the way back out.

use std::sync::Arc;

use tracing::info;

use super::adapter::{StoreAdapter, StoredEntry};
use super::codec;
use super::entry::{collect_entry, Entry, EntrySink, EntrySource};
use super::local::ArenaFieldStore;
use super::metrics::MetricsSnapshot;
use super::store::{FieldStore, InMemoryFieldStore};
use crate::config::{BackendKind, CacheConfig};
use crate::error::{Error, Result};

/// Key-value cache of inference responses
pub struct ResponseCache {
    adapter: StoreAdapter,
}

impl ResponseCache {
    /// Cache over an arbitrary field store
    pub fn new(store: Arc<dyn FieldStore>) -> Self {
        info!(backend = store.name(), "response cache created");
        Self {
            adapter: StoreAdapter::new(store),
        }
    }

    /// Cache over a local arena of `capacity` bytes
    pub fn local(capacity: usize) -> Self {
        Self::new(Arc::new(ArenaFieldStore::with_capacity(capacity)))
    }

    /// Create with an unbounded in-memory store (for testing)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryFieldStore::new()))
    }

    /// Build the backend described by `config`
    ///
    /// Remote backends connect (and ping) here, so an unreachable server
    /// fails construction.
    pub fn create(config: &CacheConfig) -> Result<Self> {
        match config {
            CacheConfig::Local(local) => {
                if local.size == 0 {
                    return Err(Error::invalid("local cache size must be greater than zero"));
                }
                Ok(Self::local(local.size))
            }
            #[cfg(feature = "redis")]
            CacheConfig::Redis(redis) => {
                let store = super::remote::RedisFieldStore::connect(redis)?;
                Ok(Self::new(Arc::new(store)))
            }
            #[cfg(not(feature = "redis"))]
            CacheConfig::Redis(_) => Err(Error::invalid(
                "redis backend requested but this build has no redis support",
            )),
        }
    }

    /// Parse `json` for `backend` and build the cache
    pub fn from_json(backend: BackendKind, json: &str) -> Result<Self> {
        Self::create(&CacheConfig::from_json(backend, json)?)
    }

    /// Name of the backing store
    pub fn backend_name(&self) -> &'static str {
        self.adapter.store().name()
    }

    /// The backing store
    pub fn store(&self) -> &Arc<dyn FieldStore> {
        self.adapter.store()
    }

    /// Whether an entry is cached under `key`
    pub fn exists(&self, key: &str) -> bool {
        self.adapter.exists(key)
    }

    /// Fetch and decode the entry under `key`
    pub fn lookup(&self, key: &str) -> Result<Entry> {
        let stored = self.adapter.lookup(key)?;
        self.decode(&stored, codec::decode)
    }

    /// Fetch the entry under `key` and stream it into `sink`
    ///
    /// The record is fully validated before `sink` sees any buffer. Returns
    /// the number of buffers delivered.
    pub fn lookup_into<S: EntrySink + ?Sized>(&self, key: &str, sink: &mut S) -> Result<usize> {
        let stored = self.adapter.lookup(key)?;
        self.decode(&stored, |fields| codec::decode_into(fields, sink))
    }

    /// Fetch the raw field record under `key` without decoding it
    pub fn lookup_raw(&self, key: &str) -> Result<StoredEntry> {
        self.adapter.lookup(key)
    }

    /// Encode and store `entry` under `key`
    ///
    /// Never overwrites: an existing key yields `AlreadyExists`.
    pub fn insert(&self, key: &str, entry: &Entry) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid("key was empty"));
        }
        let record = codec::encode(entry).map_err(|err| {
            self.adapter.metrics().record_insert_error();
            err
        })?;
        self.adapter.insert(key, &record)
    }

    /// Copy an entry out of any [`EntrySource`] and store it under `key`
    pub fn insert_from<S: EntrySource + ?Sized>(&self, key: &str, source: &S) -> Result<()> {
        let entry = collect_entry(source)?;
        self.insert(key, &entry)
    }

    /// Drop every cached entry and reset the counters
    pub fn flush(&self) -> Result<()> {
        self.adapter.flush()?;
        info!(backend = self.backend_name(), "response cache flushed");
        Ok(())
    }

    /// Current counters and backing store statistics
    pub fn metrics(&self) -> MetricsSnapshot {
        self.adapter
            .metrics()
            .snapshot(self.adapter.store().stats())
    }

    /// Current metrics in the Prometheus text format
    pub fn prometheus(&self) -> Result<String> {
        self.metrics().to_prometheus(self.backend_name())
    }

    fn decode<T>(
        &self,
        stored: &StoredEntry,
        decode: impl FnOnce(&codec::FieldMap) -> Result<T>,
    ) -> Result<T> {
        decode(&stored.fields).map_err(|err| {
            self.adapter.metrics().record_lookup_error();
            err
        })
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("backend", &self.backend_name())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{Buffer, Item, MemoryKind};
    use crate::error::ErrorKind;
    use assert_matches::assert_matches;

    fn sample_entry() -> Entry {
        Entry::from_items(vec![
            Item::from_buffers(vec![Buffer::new(&b"logits"[..]), Buffer::new(&b"ids"[..])]),
            Item::from_buffers(vec![Buffer::new(&b"second"[..])]),
        ])
    }

    #[test]
    fn test_round_trip() {
        let cache = ResponseCache::local(4096);
        let entry = sample_entry();
        cache.insert("req-1", &entry).unwrap();

        assert!(cache.exists("req-1"));
        assert_eq!(cache.lookup("req-1").unwrap(), entry);
    }

    #[test]
    fn test_lookup_into_sink() {
        let cache = ResponseCache::in_memory();
        cache.insert("req-1", &sample_entry()).unwrap();

        let mut sink = Entry::new();
        assert_eq!(cache.lookup_into("req-1", &mut sink).unwrap(), 3);
        assert_eq!(sink, sample_entry());
    }

    #[test]
    fn test_lookup_raw_counts_header_slot() {
        let cache = ResponseCache::in_memory();
        cache.insert("req-1", &sample_entry()).unwrap();
        // three buffers plus the header slot
        assert_eq!(cache.lookup_raw("req-1").unwrap().buffer_count, 4);
    }

    #[test]
    fn test_insert_from_source() {
        let cache = ResponseCache::in_memory();
        let entry = sample_entry();
        cache.insert_from("req-1", &entry).unwrap();
        assert_eq!(cache.lookup("req-1").unwrap(), entry);
    }

    #[test]
    fn test_gpu_buffer_rejected() {
        let cache = ResponseCache::local(1024);
        let entry = Entry::from_items(vec![Item::from_buffers(vec![Buffer::with_memory(
            &b"on-device"[..],
            MemoryKind::Gpu,
            0,
        )])]);

        let err = cache.insert("gpu", &entry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!cache.exists("gpu"));
        assert_eq!(cache.metrics().insert_errors, 1);
    }

    #[test]
    fn test_empty_entry_rejected() {
        let cache = ResponseCache::in_memory();
        assert_matches!(cache.insert("k", &Entry::new()), Err(Error::Internal(_)));
        assert!(!cache.exists("k"));
    }

    #[test]
    fn test_create_local_requires_size() {
        assert_matches!(
            ResponseCache::create(&CacheConfig::local(0)),
            Err(Error::InvalidArgument(_))
        );
        let cache = ResponseCache::create(&CacheConfig::local(64)).unwrap();
        assert_eq!(cache.backend_name(), "local");
    }

    #[test]
    fn test_from_json_local() {
        let cache = ResponseCache::from_json(BackendKind::Local, r#"{"size": "2048"}"#).unwrap();
        assert_eq!(cache.metrics().store.capacity, Some(2048));
    }

    #[test]
    fn test_metrics_and_flush() {
        let cache = ResponseCache::local(1024);
        cache.insert("a", &sample_entry()).unwrap();
        cache.lookup("a").unwrap();
        assert_matches!(cache.lookup("b"), Err(Error::NotFound(_)));

        let snapshot = cache.metrics();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.store.entries, 1);
        assert!(cache.prometheus().unwrap().contains("respcache_hits_total"));

        cache.flush().unwrap();
        assert!(!cache.exists("a"));
        assert_eq!(cache.metrics().hits, 0);
        assert_eq!(cache.metrics().store.entries, 0);
    }
}
