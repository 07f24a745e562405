//! Property-Based Tests for the Response Cache
//!
//! # Test Properties
//!
//! 1. **Roundtrip**: decode(encode(entry)) = entry, item boundaries included
//! 2. **Store Roundtrip**: lookup after insert returns the inserted entry
//! 3. **Arena Disjointness**: live slots never overlap, accounting stays exact
//! 4. **Bounded Arena**: inserts never push usage past capacity

#![cfg(test)]

use proptest::prelude::*;

use super::arena::{PoolArena, Slot};
use super::codec::{decode, encode};
use super::entry::{Buffer, Entry, Item, MemoryKind};
use super::local::ArenaFieldStore;
use super::manager::ResponseCache;
use super::store::FieldStore;
use super::FIELDS_PER_BUFFER;

// =============================================================================
// Property Strategies
// =============================================================================

fn buffer_strategy() -> impl Strategy<Value = Buffer> {
    (
        prop::collection::vec(any::<u8>(), 1..256),
        prop_oneof![Just(MemoryKind::Cpu), Just(MemoryKind::CpuPinned)],
        0i64..4,
    )
        .prop_map(|(data, kind, device)| Buffer::with_memory(data, kind, device))
}

/// Entries with at least one buffer; empty items are allowed in between
fn entry_strategy() -> impl Strategy<Value = Entry> {
    prop::collection::vec(prop::collection::vec(buffer_strategy(), 0..4), 1..5)
        .prop_filter("entry needs at least one buffer", |items| {
            items.iter().any(|buffers| !buffers.is_empty())
        })
        .prop_map(|items| Entry::from_items(items.into_iter().map(Item::from_buffers).collect()))
}

#[derive(Debug, Clone)]
enum ArenaOp {
    Allocate(usize),
    Free(usize),
}

fn arena_ops_strategy() -> impl Strategy<Value = Vec<ArenaOp>> {
    prop::collection::vec(
        prop_oneof![
            (1usize..200).prop_map(ArenaOp::Allocate),
            any::<usize>().prop_map(ArenaOp::Free),
        ],
        1..100,
    )
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: encoding then decoding returns the original entry.
    #[test]
    fn prop_codec_roundtrip(entry in entry_strategy()) {
        let fields = encode(&entry)?;
        prop_assert_eq!(fields.len(), (entry.buffer_count() + 1) * FIELDS_PER_BUFFER);

        let decoded = decode(&fields)?;
        prop_assert_eq!(decoded, entry);
    }

    /// Property: dropping any single field makes the record undecodable.
    #[test]
    fn prop_codec_detects_missing_field(
        entry in entry_strategy(),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut fields = encode(&entry)?;
        let name = pick.get(&fields.keys().cloned().collect::<Vec<_>>()).clone();
        fields.remove(&name);
        prop_assert!(decode(&fields).is_err());
    }

    /// Property: an entry stored in a roomy arena comes back unchanged.
    #[test]
    fn prop_local_store_roundtrip(entries in prop::collection::vec(entry_strategy(), 1..8)) {
        let cache = ResponseCache::local(64 * 1024);
        for (i, entry) in entries.iter().enumerate() {
            cache.insert(&format!("key-{}", i), entry)?;
        }
        for (i, entry) in entries.iter().enumerate() {
            prop_assert_eq!(&cache.lookup(&format!("key-{}", i))?, entry);
        }
    }
}

// =============================================================================
// Arena Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: live slots are pairwise disjoint and `used` is their sum.
    #[test]
    fn prop_arena_slots_disjoint(ops in arena_ops_strategy()) {
        let mut arena = PoolArena::new(1024);
        let mut live: Vec<Slot> = Vec::new();

        for op in ops {
            match op {
                ArenaOp::Allocate(len) => {
                    if let Some(slot) = arena.try_allocate(len) {
                        prop_assert!(slot.end() <= arena.capacity());
                        prop_assert!(live.iter().all(|other| !other.overlaps(&slot)));
                        live.push(slot);
                    }
                }
                ArenaOp::Free(pick) => {
                    if !live.is_empty() {
                        let slot = live.swap_remove(pick % live.len());
                        arena.free(slot);
                    }
                }
            }
            prop_assert_eq!(arena.used(), live.iter().map(Slot::len).sum::<usize>());
        }

        for slot in live.drain(..) {
            arena.free(slot);
        }
        prop_assert_eq!(arena.fragment_count(), 1);
        prop_assert_eq!(arena.largest_free_run(), 1024);
    }

    /// Property: inserts evict as needed but never exceed capacity.
    #[test]
    fn prop_arena_store_bounded(entries in prop::collection::vec(entry_strategy(), 1..20)) {
        let store = ArenaFieldStore::with_capacity(1024);
        for (i, entry) in entries.iter().enumerate() {
            let fields = encode(entry)?;
            // entries larger than the arena are rejected outright
            let _ = store.put_new(&format!("key-{}", i), &fields);
            prop_assert!(store.used() <= store.capacity());
        }
        let stats = store.stats();
        prop_assert_eq!(stats.bytes, store.used() as u64);
        prop_assert_eq!(stats.entries, store.len() as u64);
    }
}
