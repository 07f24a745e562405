//! Local Arena Store
//!
//! In-process [`FieldStore`] whose payload fields live in a fixed-size
//! [`PoolArena`]. Small attribute fields are kept in the key index; payload
//! fields are copied into arena slots.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards the arena, the key index and the
//!   recency queue together, so allocation, eviction and indexing of one
//!   request never interleave with another's
//! - When the arena cannot fit all of a record's payloads at once, the least
//!   recently used record is evicted and the whole set retried, until it fits
//!   or nothing is left
//! - Recency ticks come from a counter, so eviction order is deterministic
//! - A record's slots are freed in the same critical section that removes it
//!   from the index; no indexed record ever points at freed memory

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::arena::{PoolArena, Slot};
use super::codec::{BufferField, FieldMap};
use super::store::{FieldStore, StoreError, StoreResult, StoreStats};

/// Indexed record for one key
struct Record {
    /// Non-payload fields, stored inline
    fields: FieldMap,
    /// Payload fields and the arena slot holding each
    payloads: Vec<(String, Slot)>,
    /// Recency tick of the last insert or read
    tick: u64,
}

impl Record {
    fn payload_bytes(&self) -> usize {
        self.payloads.iter().map(|(_, slot)| slot.len()).sum()
    }
}

/// Everything guarded by the arena lock
struct ArenaState {
    arena: PoolArena,
    index: HashMap<String, Record>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    evictions: u64,
}

impl ArenaState {
    fn new(capacity: usize) -> Self {
        Self {
            arena: PoolArena::new(capacity),
            index: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Serve every length in `lens`, evicting least recently used records
    /// until the whole set fits at once
    ///
    /// Slots staged for a failed attempt are released before the next
    /// eviction, so they never pin free runs apart. Once nothing is left to
    /// evict the arena is one free run, and any set whose total fits in
    /// capacity is placed.
    fn allocate_all(&mut self, lens: &[usize]) -> StoreResult<Vec<Slot>> {
        let total: usize = lens.iter().sum();
        if total > self.arena.capacity() {
            return Err(StoreError::CacheFull(format!(
                "requested {} bytes exceeds arena capacity of {} bytes",
                total,
                self.arena.capacity()
            )));
        }
        loop {
            let mut staged = Vec::with_capacity(lens.len());
            for &len in lens {
                match self.arena.try_allocate(len) {
                    Some(slot) => staged.push(slot),
                    None => break,
                }
            }
            if staged.len() == lens.len() {
                return Ok(staged);
            }
            for slot in staged {
                self.arena.free(slot);
            }
            self.evict().map_err(|_| {
                StoreError::CacheFull(format!(
                    "unable to allocate {} bytes: arena exhausted with nothing left to evict",
                    total
                ))
            })?;
        }
    }

    /// Remove the least recently used record and release its slots
    fn evict(&mut self) -> StoreResult<String> {
        let (_, key) = self
            .recency
            .pop_first()
            .ok_or_else(|| StoreError::CacheFull("no entries left to evict".into()))?;
        if let Some(record) = self.index.remove(&key) {
            debug!(
                key = %key,
                bytes = record.payload_bytes(),
                "evicting least recently used entry"
            );
            self.release(record);
        }
        self.evictions += 1;
        Ok(key)
    }

    fn release(&mut self, record: Record) {
        for (_, slot) in record.payloads {
            self.arena.free(slot);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.index.remove(key) {
            Some(record) => {
                self.recency.remove(&record.tick);
                self.release(record);
                true
            }
            None => false,
        }
    }

    fn reset(&mut self) {
        self.index.clear();
        self.recency.clear();
        self.arena.reset();
    }
}

/// Field store backed by a fixed-capacity in-process arena
pub struct ArenaFieldStore {
    state: Mutex<ArenaState>,
    capacity: usize,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl ArenaFieldStore {
    /// Create a store over an arena of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArenaState::new(capacity)),
            capacity,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Arena capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of arena currently holding payloads
    pub fn used(&self) -> usize {
        self.state.lock().arena.used()
    }

    /// Number of indexed records
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict the least recently used record, returning its key
    ///
    /// Fails with [`StoreError::CacheFull`] when nothing is left to evict.
    pub fn evict(&self) -> StoreResult<String> {
        self.state.lock().evict()
    }

    /// Keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.state.lock().recency.values().cloned().collect()
    }

    /// Arena slots currently owned by `key`
    pub fn slots(&self, key: &str) -> Vec<Slot> {
        self.state
            .lock()
            .index
            .get(key)
            .map(|record| record.payloads.iter().map(|(_, slot)| *slot).collect())
            .unwrap_or_default()
    }

    /// Drop a single field from a stored record
    ///
    /// Only useful for diagnosing how the cache reacts to damaged records.
    pub fn remove_field(&self, key: &str, field: &str) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.index.get_mut(key) else {
            return false;
        };
        if record.fields.remove(field).is_some() {
            return true;
        }
        match record.payloads.iter().position(|(name, _)| name == field) {
            Some(pos) => {
                let (_, slot) = record.payloads.remove(pos);
                state.arena.free(slot);
                true
            }
            None => false,
        }
    }
}

impl FieldStore for ArenaFieldStore {
    fn name(&self) -> &'static str {
        "local"
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.lock().index.contains_key(key))
    }

    fn get_all(&self, key: &str) -> StoreResult<FieldMap> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let tick = state.tick();
        let Some(record) = state.index.get_mut(key) else {
            return Ok(FieldMap::new());
        };
        state.recency.remove(&record.tick);
        record.tick = tick;
        state.recency.insert(tick, key.to_string());

        let mut fields = record.fields.clone();
        for (name, slot) in &record.payloads {
            fields.insert(name.clone(), Bytes::copy_from_slice(state.arena.read(*slot)));
        }
        Ok(fields)
    }

    fn put_new(&self, key: &str, fields: &FieldMap) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state.index.contains_key(key) {
            return Ok(false);
        }

        let (payload_fields, inline): (Vec<_>, Vec<_>) = fields
            .iter()
            .partition(|(name, value)| BufferField::is_payload(name) && !value.is_empty());
        let lens: Vec<usize> = payload_fields.iter().map(|(_, value)| value.len()).collect();

        // all-or-nothing: nothing is written or indexed unless every slot fits
        let slots = state.allocate_all(&lens).map_err(|err| {
            warn!(key = %key, error = %err, "local cache insert failed");
            err
        })?;
        let mut payloads = Vec::with_capacity(slots.len());
        for ((name, value), slot) in payload_fields.into_iter().zip(slots) {
            state.arena.write(slot, value);
            payloads.push((name.clone(), slot));
        }
        let inline: FieldMap = inline
            .into_iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let tick = state.tick();
        state.recency.insert(tick, key.to_string());
        state.index.insert(
            key.to_string(),
            Record {
                fields: inline,
                payloads,
                tick,
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.lock().remove(key))
    }

    fn flush(&self) -> StoreResult<()> {
        self.state.lock().reset();
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            entries: state.index.len() as u64,
            bytes: state.arena.used() as u64,
            capacity: Some(self.capacity as u64),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: state.evictions,
        }
    }
}

impl std::fmt::Debug for ArenaFieldStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ArenaFieldStore")
            .field("arena", &state.arena)
            .field("entries", &state.index.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::thread;

    fn payload_record(len: usize, fill: u8) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("0:b".into(), Bytes::from(vec![fill; len]));
        fields.insert("0:s".into(), Bytes::from(len.to_string()));
        fields.insert("0:t".into(), Bytes::from_static(b"0"));
        fields.insert("0:i".into(), Bytes::from_static(b"0"));
        fields
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = ArenaFieldStore::with_capacity(1024);
        let fields = payload_record(100, 7);

        assert!(store.put_new("k", &fields).unwrap());
        assert_eq!(store.get_all("k").unwrap(), fields);
        assert_eq!(store.used(), 100);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_put_new_keeps_first_record() {
        let store = ArenaFieldStore::with_capacity(1024);
        assert!(store.put_new("k", &payload_record(10, 1)).unwrap());
        assert!(!store.put_new("k", &payload_record(10, 2)).unwrap());
        assert_eq!(store.get_all("k").unwrap()["0:b"][0], 1);
        assert_eq!(store.used(), 10);
    }

    #[test]
    fn test_missing_key() {
        let store = ArenaFieldStore::with_capacity(64);
        assert!(!store.exists("nope").unwrap());
        assert!(store.get_all("nope").unwrap().is_empty());
        assert!(!store.delete("nope").unwrap());
    }

    #[test]
    fn test_allocate_evicts_oldest_first() {
        let store = ArenaFieldStore::with_capacity(300);
        for key in ["a", "b", "c"] {
            store.put_new(key, &payload_record(100, 0)).unwrap();
        }
        assert_eq!(store.keys_by_recency(), vec!["a", "b", "c"]);

        store.put_new("d", &payload_record(100, 0)).unwrap();
        assert!(!store.exists("a").unwrap());
        assert_eq!(store.keys_by_recency(), vec!["b", "c", "d"]);
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_read_refreshes_recency() {
        let store = ArenaFieldStore::with_capacity(300);
        for key in ["a", "b", "c"] {
            store.put_new(key, &payload_record(100, 0)).unwrap();
        }
        store.get_all("a").unwrap();
        assert_eq!(store.keys_by_recency(), vec!["b", "c", "a"]);

        store.put_new("d", &payload_record(100, 0)).unwrap();
        assert!(store.exists("a").unwrap());
        assert!(!store.exists("b").unwrap());
    }

    #[test]
    fn test_evicts_until_fit() {
        let store = ArenaFieldStore::with_capacity(400);
        for key in ["a", "b", "c", "d"] {
            store.put_new(key, &payload_record(100, 0)).unwrap();
        }

        store.put_new("big", &payload_record(250, 0)).unwrap();
        assert_eq!(store.keys_by_recency(), vec!["d", "big"]);
        assert_eq!(store.stats().evictions, 3);
    }

    #[test]
    fn test_oversize_request_fails_without_eviction() {
        let store = ArenaFieldStore::with_capacity(200);
        store.put_new("a", &payload_record(100, 0)).unwrap();

        let err = store.put_new("huge", &payload_record(201, 0)).unwrap_err();
        assert_matches!(err, StoreError::CacheFull(msg) if msg.contains("exceeds arena capacity"));
        assert!(store.exists("a").unwrap());
        assert_eq!(store.stats().evictions, 0);
    }

    fn two_buffer_record(first: usize, second: usize) -> FieldMap {
        let mut fields = payload_record(first, 1);
        fields.insert("1:b".into(), Bytes::from(vec![2u8; second]));
        fields.insert("1:s".into(), Bytes::from(second.to_string()));
        fields.insert("1:t".into(), Bytes::from_static(b"0"));
        fields.insert("1:i".into(), Bytes::from_static(b"0"));
        fields
    }

    #[test]
    fn test_multi_buffer_record_over_capacity_fails_without_eviction() {
        let store = ArenaFieldStore::with_capacity(200);
        store.put_new("a", &payload_record(100, 0)).unwrap();

        // each buffer fits on its own, the pair does not
        let err = store.put_new("k", &two_buffer_record(150, 150)).unwrap_err();
        assert_matches!(err, StoreError::CacheFull(msg) if msg.contains("exceeds arena capacity"));
        assert!(!store.exists("k").unwrap());
        assert!(store.exists("a").unwrap());
        assert_eq!(store.used(), 100);
        assert_eq!(store.stats().evictions, 0);
    }

    #[test]
    fn test_multi_buffer_record_fits_after_fragmented_eviction() {
        let store = ArenaFieldStore::with_capacity(100);
        store.put_new("x", &payload_record(40, 0)).unwrap();
        store.put_new("y", &payload_record(10, 0)).unwrap();
        store.put_new("z", &payload_record(50, 0)).unwrap();
        store.get_all("x").unwrap();

        let fields = two_buffer_record(10, 89);
        assert!(store.put_new("new", &fields).unwrap());
        assert_eq!(store.get_all("new").unwrap(), fields);
        assert_eq!(store.used(), 99);
        assert_eq!(store.keys_by_recency(), vec!["new"]);
        assert_eq!(store.stats().evictions, 3);
    }

    #[test]
    fn test_multi_buffer_record_evicts_only_what_it_needs() {
        let store = ArenaFieldStore::with_capacity(100);
        for key in ["a", "b", "c", "d"] {
            store.put_new(key, &payload_record(25, 0)).unwrap();
        }

        assert!(store.put_new("new", &two_buffer_record(20, 20)).unwrap());
        assert_eq!(store.keys_by_recency(), vec!["c", "d", "new"]);
        assert_eq!(store.used(), 90);
    }

    #[test]
    fn test_evict_on_empty_store_fails() {
        let store = ArenaFieldStore::with_capacity(64);
        assert_matches!(store.evict(), Err(StoreError::CacheFull(_)));
    }

    #[test]
    fn test_explicit_evict_releases_memory() {
        let store = ArenaFieldStore::with_capacity(64);
        store.put_new("a", &payload_record(32, 0)).unwrap();
        store.put_new("b", &payload_record(32, 0)).unwrap();

        assert_eq!(store.evict().unwrap(), "a");
        assert_eq!(store.used(), 32);
        assert!(store.slots("a").is_empty());
    }

    #[test]
    fn test_flush_resets_everything() {
        let store = ArenaFieldStore::with_capacity(64);
        store.put_new("a", &payload_record(32, 0)).unwrap();
        store.flush().unwrap();

        assert!(store.is_empty());
        assert_eq!(store.used(), 0);
        assert!(store.keys_by_recency().is_empty());
    }

    #[test]
    fn test_remove_payload_field_frees_slot() {
        let store = ArenaFieldStore::with_capacity(64);
        store.put_new("a", &payload_record(32, 0)).unwrap();

        assert!(store.remove_field("a", "0:b"));
        assert_eq!(store.used(), 0);
        assert_eq!(store.get_all("a").unwrap().len(), 3);
        assert!(store.remove_field("a", "0:t"));
        assert!(!store.remove_field("a", "0:t"));
    }

    #[test]
    fn test_concurrent_inserts_never_overlap() {
        let store = Arc::new(ArenaFieldStore::with_capacity(4096));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("k-{}-{}", t, i);
                        let fields = payload_record(64 + (i % 4) * 32, t as u8);
                        store.put_new(&key, &fields).unwrap();
                        if let Ok(read) = store.get_all(&key) {
                            if !read.is_empty() {
                                assert!(read["0:b"].iter().all(|b| *b == t as u8));
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let state = store.state.lock();
        let slots: Vec<Slot> = state
            .index
            .values()
            .flat_map(|r| r.payloads.iter().map(|(_, s)| *s))
            .collect();
        for (i, a) in slots.iter().enumerate() {
            for b in &slots[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
        assert!(state.arena.used() <= 4096);
        assert_eq!(state.index.len(), state.recency.len());
    }
}
