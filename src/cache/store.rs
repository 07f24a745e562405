//! Backing Field Stores
//!
//! A [`FieldStore`] is a dumb map from key to [`FieldMap`]. The cache never
//! asks it to interpret fields; it only needs existence checks, whole-record
//! reads and one bulk write per key.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use thiserror::Error;

use super::codec::FieldMap;

/// Failures reported by a backing store
///
/// These stay inside the crate: the store adapter converts each of them into
/// [`crate::Error::Internal`] carrying the cause text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connect, socket or pool wait timeout
    #[error("timed out: {0}")]
    Timeout(String),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Could not reach the store
    #[error("connection error: {0}")]
    Connection(String),

    /// Nothing left to evict and the request still does not fit
    #[error("cache full: {0}")]
    CacheFull(String),

    /// Anything else the backend reported
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failure was a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

/// Result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Backing key to field-map store
pub trait FieldStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Whether `key` holds a record. Missing keys are not an error.
    fn exists(&self, key: &str) -> StoreResult<bool>;

    /// All fields stored under `key`; empty when the key is missing
    fn get_all(&self, key: &str) -> StoreResult<FieldMap>;

    /// Write every field of a new record in one bulk operation
    ///
    /// Returns `Ok(false)` without writing when the store can tell the key is
    /// already present. Stores without a conditional write may overwrite.
    fn put_new(&self, key: &str, fields: &FieldMap) -> StoreResult<bool>;

    /// Remove the record under `key`, returning whether one existed
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remove every record
    fn flush(&self) -> StoreResult<()>;

    /// Store statistics
    fn stats(&self) -> StoreStats;
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Records currently stored
    pub entries: u64,
    /// Value bytes currently stored
    pub bytes: u64,
    /// Capacity in bytes, when the store is bounded
    pub capacity: Option<u64>,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
    /// Records reclaimed to make room
    pub evictions: u64,
}

fn record_bytes(fields: &FieldMap) -> u64 {
    fields.values().map(|v| v.len() as u64).sum()
}

/// Unbounded in-memory store
///
/// Uses DashMap so concurrent callers only contend on the shard holding
/// their key. `put_new` is a true set-if-absent.
#[derive(Default)]
pub struct InMemoryFieldStore {
    records: DashMap<String, FieldMap>,
    bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryFieldStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a single field from a stored record
    ///
    /// Only useful for diagnosing how the cache reacts to damaged records.
    pub fn remove_field(&self, key: &str, field: &str) -> bool {
        match self.records.get_mut(key) {
            Some(mut record) => match record.remove(field) {
                Some(value) => {
                    self.bytes.fetch_sub(value.len() as u64, Ordering::Relaxed);
                    true
                }
                None => false,
            },
            None => false,
        }
    }
}

impl FieldStore for InMemoryFieldStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.contains_key(key))
    }

    fn get_all(&self, key: &str) -> StoreResult<FieldMap> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .records
            .get(key)
            .map(|record| record.clone())
            .unwrap_or_default())
    }

    fn put_new(&self, key: &str, fields: &FieldMap) -> StoreResult<bool> {
        match self.records.entry(key.to_string()) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(slot) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(record_bytes(fields), Ordering::Relaxed);
                slot.insert(fields.clone());
                Ok(true)
            }
        }
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        match self.records.remove(key) {
            Some((_, fields)) => {
                self.bytes.fetch_sub(record_bytes(&fields), Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn flush(&self) -> StoreResult<()> {
        self.records.clear();
        self.bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.records.len() as u64,
            bytes: self.bytes.load(Ordering::Relaxed),
            capacity: None,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v.as_bytes())))
            .collect()
    }

    #[test]
    fn test_in_memory_put_get() {
        let store = InMemoryFieldStore::new();
        let fields = record(&[("0:b", "data"), ("0:s", "4")]);

        assert!(store.put_new("key", &fields).unwrap());
        assert!(store.exists("key").unwrap());
        assert_eq!(store.get_all("key").unwrap(), fields);
    }

    #[test]
    fn test_in_memory_missing_key_is_empty() {
        let store = InMemoryFieldStore::new();
        assert!(!store.exists("missing").unwrap());
        assert!(store.get_all("missing").unwrap().is_empty());
    }

    #[test]
    fn test_in_memory_put_new_does_not_overwrite() {
        let store = InMemoryFieldStore::new();
        let first = record(&[("0:b", "one")]);
        let second = record(&[("0:b", "two")]);

        assert!(store.put_new("key", &first).unwrap());
        assert!(!store.put_new("key", &second).unwrap());
        assert_eq!(store.get_all("key").unwrap(), first);
    }

    #[test]
    fn test_in_memory_delete_and_flush() {
        let store = InMemoryFieldStore::new();
        store.put_new("a", &record(&[("0:b", "aa")])).unwrap();
        store.put_new("b", &record(&[("0:b", "bbb")])).unwrap();

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.stats().bytes, 3);

        store.flush().unwrap();
        let stats = store.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.bytes, 0);
    }

    #[test]
    fn test_in_memory_remove_field() {
        let store = InMemoryFieldStore::new();
        store
            .put_new("key", &record(&[("0:b", "xy"), ("0:s", "2")]))
            .unwrap();

        assert!(store.remove_field("key", "0:s"));
        assert!(!store.remove_field("key", "0:s"));
        assert!(!store.remove_field("other", "0:s"));
        assert_eq!(store.get_all("key").unwrap().len(), 1);
    }

    #[test]
    fn test_in_memory_stats() {
        let store = InMemoryFieldStore::new();
        store.put_new("k", &record(&[("0:b", "12345")])).unwrap();
        store.get_all("k").unwrap();
        store.exists("k").unwrap();

        let stats = store.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 5);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.capacity, None);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Timeout("socket read after 50ms".into());
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "timed out: socket read after 50ms");
    }
}
