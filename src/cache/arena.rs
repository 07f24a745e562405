//! Pool Arena
//!
//! A single fixed-capacity byte region from which payload slots are carved.
//!
//! # Design
//!
//! - One contiguous `Box<[u8]>`, allocated once at construction
//! - Free space tracked as `offset -> length` runs in a `BTreeMap`
//! - First-fit allocation, neighbouring runs coalesced on free
//!
//! The arena itself is not synchronized. [`super::local::ArenaFieldStore`]
//! owns it behind the same lock as its key index so slots can never be
//! reused while an indexed record still points at them.

use std::collections::BTreeMap;

/// A region handed out by [`PoolArena::try_allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    offset: usize,
    len: usize,
}

impl Slot {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Whether two slots share any byte
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Fixed-capacity first-fit arena
pub struct PoolArena {
    memory: Box<[u8]>,
    free: BTreeMap<usize, usize>,
    used: usize,
}

impl PoolArena {
    /// Create an arena of `capacity` bytes, all free
    pub fn new(capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            memory: vec![0u8; capacity].into_boxed_slice(),
            free,
            used: 0,
        }
    }

    /// Total bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes currently allocated
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes currently free (possibly fragmented)
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.used
    }

    /// Number of disjoint free runs
    pub fn fragment_count(&self) -> usize {
        self.free.len()
    }

    /// Largest request that would currently succeed
    pub fn largest_free_run(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Carve `len` bytes out of the first free run large enough
    ///
    /// Returns `None` for zero-length requests and when no single run fits.
    /// Never evicts; that policy lives with the owner of the index.
    pub fn try_allocate(&mut self, len: usize) -> Option<Slot> {
        if len == 0 {
            return None;
        }
        let (offset, run) = self
            .free
            .iter()
            .find(|(_, run)| **run >= len)
            .map(|(offset, run)| (*offset, *run))?;

        self.free.remove(&offset);
        if run > len {
            self.free.insert(offset + len, run - len);
        }
        self.used += len;
        Some(Slot { offset, len })
    }

    /// Return a slot to the free list, merging with adjacent runs
    pub fn free(&mut self, slot: Slot) {
        if slot.is_empty() {
            return;
        }
        debug_assert!(slot.end() <= self.capacity());
        debug_assert!(
            !self
                .free
                .iter()
                .any(|(offset, len)| slot.overlaps(&Slot { offset: *offset, len: *len })),
            "double free of arena slot {:?}",
            slot
        );

        let mut offset = slot.offset;
        let mut len = slot.len;

        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&slot.end()) {
            self.free.remove(&slot.end());
            len += next_len;
        }

        self.free.insert(offset, len);
        self.used -= slot.len;
    }

    /// Copy `data` into `slot`
    ///
    /// # Panics
    ///
    /// Panics if `data` is not exactly `slot.len()` bytes.
    pub fn write(&mut self, slot: Slot, data: &[u8]) {
        self.memory[slot.offset..slot.end()].copy_from_slice(data);
    }

    /// View the bytes of `slot`
    pub fn read(&self, slot: Slot) -> &[u8] {
        &self.memory[slot.offset..slot.end()]
    }

    /// Free everything
    pub fn reset(&mut self) {
        self.free.clear();
        if self.capacity() > 0 {
            self.free.insert(0, self.capacity());
        }
        self.used = 0;
    }
}

impl std::fmt::Debug for PoolArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolArena")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("fragments", &self.free.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
