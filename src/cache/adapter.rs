//! Store Adapter
//!
//! Puts `exists`/`lookup`/`insert` in front of one [`FieldStore`] and folds
//! every backend failure into the cache error taxonomy.
//!
//! Existence checks and the reads/writes that follow them are separate store
//! calls with no transaction around them. Two inserts of the same key racing
//! each other can both pass the existence check; the store's `put_new`
//! decides the winner where it supports set-if-absent, otherwise the last
//! writer wins.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::codec::FieldMap;
use super::metrics::CacheMetrics;
use super::store::{FieldStore, StoreError};
use super::FIELDS_PER_BUFFER;
use crate::error::{Error, Result};

/// Raw record returned by [`StoreAdapter::lookup`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Every field stored under the key
    pub fields: FieldMap,
    /// `fields.len() / FIELDS_PER_BUFFER`
    pub buffer_count: usize,
}

/// Existence-checked access to a backing field store
pub struct StoreAdapter {
    store: Arc<dyn FieldStore>,
    metrics: Arc<CacheMetrics>,
}

impl StoreAdapter {
    /// Wrap `store`
    pub fn new(store: Arc<dyn FieldStore>) -> Self {
        Self {
            store,
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// The wrapped store
    pub fn store(&self) -> &Arc<dyn FieldStore> {
        &self.store
    }

    /// Counters maintained by this adapter
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Whether `key` holds a record
    ///
    /// Never fails: a backend fault is logged and reported as absent.
    pub fn exists(&self, key: &str) -> bool {
        match self.store.exists(key) {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    key = %key,
                    backend = self.store.name(),
                    error = %err,
                    "existence check failed"
                );
                false
            }
        }
    }

    /// Fetch the raw record stored under `key`
    #[instrument(level = "debug", skip(self), fields(backend = self.store.name()))]
    pub fn lookup(&self, key: &str) -> Result<StoredEntry> {
        if key.is_empty() {
            return Err(Error::invalid("key was empty"));
        }
        self.metrics.record_lookup();

        let present = self.store.exists(key).map_err(|err| {
            self.metrics.record_lookup_error();
            warn!(error = %err, "cache existence check failed");
            handle_error(Operation::Retrieve, key, &err)
        })?;
        if !present {
            self.metrics.record_miss();
            debug!("cache miss");
            return Err(Error::NotFound(format!("did not find entry for key {}", key)));
        }

        let fields = match self.store.get_all(key) {
            Ok(fields) => fields,
            Err(err) => {
                self.metrics.record_lookup_error();
                warn!(error = %err, "cache lookup failed");
                return Err(handle_error(Operation::Retrieve, key, &err));
            }
        };

        // evicted or deleted between the two calls
        if fields.is_empty() {
            self.metrics.record_miss();
            debug!("cache miss after existence check");
            return Err(Error::NotFound(format!("did not find entry for key {}", key)));
        }

        self.metrics.record_hit();
        debug!(fields = fields.len(), "cache hit");
        Ok(StoredEntry {
            buffer_count: fields.len() / FIELDS_PER_BUFFER,
            fields,
        })
    }

    /// Persist a new record under `key` in one bulk write
    #[instrument(
        level = "debug",
        skip(self, record),
        fields(backend = self.store.name(), fields = record.len())
    )]
    pub fn insert(&self, key: &str, record: &FieldMap) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid("key was empty"));
        }
        if record.is_empty() || record.len() % FIELDS_PER_BUFFER != 0 {
            self.metrics.record_insert_error();
            return Err(Error::internal("Attempted to add incomplete entry to cache"));
        }

        let present = self.store.exists(key).map_err(|err| {
            self.metrics.record_insert_error();
            warn!(error = %err, "cache existence check failed");
            handle_error(Operation::Insert, key, &err)
        })?;
        if present {
            self.metrics.record_duplicate_insert();
            return Err(already_exists(key));
        }

        match self.store.put_new(key, record) {
            Ok(true) => {
                let bytes = record.values().map(|v| v.len() as u64).sum();
                self.metrics.record_insert(bytes);
                debug!("cache insert");
                Ok(())
            }
            Ok(false) => {
                self.metrics.record_duplicate_insert();
                Err(already_exists(key))
            }
            Err(err) => {
                self.metrics.record_insert_error();
                warn!(error = %err, "cache insert failed");
                Err(handle_error(Operation::Insert, key, &err))
            }
        }
    }

    /// Remove every record and reset the counters
    pub fn flush(&self) -> Result<()> {
        self.store
            .flush()
            .map_err(|err| Error::internal(format!("failed to flush cache: {}", err)))?;
        self.metrics.reset();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Retrieve,
    Insert,
}

fn already_exists(key: &str) -> Error {
    Error::AlreadyExists(format!("key {} is already present in the cache", key))
}

/// Convert a store failure into `Internal` with the cause appended
fn handle_error(op: Operation, key: &str, cause: &StoreError) -> Error {
    let message = match (op, cause.is_timeout()) {
        _ if matches!(cause, StoreError::CacheFull(_)) => {
            format!("Cache full while inserting key: {}. ", key)
        }
        (Operation::Retrieve, true) => format!("Timeout retrieving key: {}. ", key),
        (Operation::Retrieve, false) => format!("Failed to retrieve key: {}. ", key),
        (Operation::Insert, true) => format!("Timeout inserting key: {}. ", key),
        (Operation::Insert, false) => format!("Failed to insert key: {}. ", key),
    };
    Error::Internal(format!("{}{}", message, cause))
}

// =============================================================================
// Tests
// =============================================================================
