//! Cache Entry Types
//!
//! In-memory model of a cached inference result: an [`Entry`] holds ordered
//! [`Item`]s, each holding ordered [`Buffer`]s with their attributes.
//!
//! The host runtime never hands us an `Entry` directly. It exposes an opaque
//! handle with count/indexed getters on insert and an append callback on
//! lookup; [`EntrySource`] and [`EntrySink`] model those two directions so
//! the cache can be driven by anything that can enumerate or receive buffers.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Where a buffer's bytes reside, using the host's integral encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MemoryKind {
    /// Pageable host memory
    Cpu = 0,
    /// Page-locked host memory
    CpuPinned = 1,
    /// Device memory
    Gpu = 2,
}

impl MemoryKind {
    /// Whether buffers of this kind may be stored in the cache
    #[inline]
    pub fn is_cacheable(self) -> bool {
        matches!(self, MemoryKind::Cpu | MemoryKind::CpuPinned)
    }

    /// Integral value written to the field map
    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for MemoryKind {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(MemoryKind::Cpu),
            1 => Ok(MemoryKind::CpuPinned),
            2 => Ok(MemoryKind::Gpu),
            other => Err(Error::internal(format!("unknown memory type {}", other))),
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryKind::Cpu => write!(f, "CPU"),
            MemoryKind::CpuPinned => write!(f, "CPU_PINNED"),
            MemoryKind::Gpu => write!(f, "GPU"),
        }
    }
}

/// Attributes travelling with every buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAttributes {
    /// Payload length in bytes
    pub byte_size: u64,
    /// Memory residency
    pub memory_kind: MemoryKind,
    /// Device ordinal for `memory_kind`
    pub memory_device_id: i64,
}

/// Immutable byte range plus attributes
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Bytes,
    memory_kind: MemoryKind,
    memory_device_id: i64,
}

impl Buffer {
    /// Create a CPU buffer on device 0
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::with_memory(data, MemoryKind::Cpu, 0)
    }

    /// Create a buffer with explicit memory attributes
    pub fn with_memory(
        data: impl Into<Bytes>,
        memory_kind: MemoryKind,
        memory_device_id: i64,
    ) -> Self {
        Self {
            data: data.into(),
            memory_kind,
            memory_device_id,
        }
    }

    /// Payload (zero-copy)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn memory_kind(&self) -> MemoryKind {
        self.memory_kind
    }

    #[inline]
    pub fn memory_device_id(&self) -> i64 {
        self.memory_device_id
    }

    /// Attribute block for this buffer
    pub fn attributes(&self) -> BufferAttributes {
        BufferAttributes {
            byte_size: self.byte_size(),
            memory_kind: self.memory_kind,
            memory_device_id: self.memory_device_id,
        }
    }

    /// Check the buffer may be cached
    ///
    /// Zero-length payloads are an internal error, non-CPU memory is an
    /// invalid argument.
    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(Error::internal("buffer size was zero"));
        }
        if !self.memory_kind.is_cacheable() {
            return Err(Error::invalid(format!(
                "only CPU memory buffers may be cached, got {}",
                self.memory_kind
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("byte_size", &self.byte_size())
            .field("memory_kind", &self.memory_kind)
            .field("memory_device_id", &self.memory_device_id)
            .finish()
    }
}

/// Ordered buffers of one positional result component
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    buffers: Vec<Buffer>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_buffers(buffers: Vec<Buffer>) -> Self {
        Self { buffers }
    }

    pub fn push(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Full cached result for one key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    items: Vec<Item>,
}

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<Item>) -> Self {
        Self { items }
    }

    pub fn push_item(&mut self, item: Item) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Number of items
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Total number of buffers across all items
    pub fn buffer_count(&self) -> usize {
        self.items.iter().map(Item::len).sum()
    }

    /// Sum of all payload sizes
    pub fn total_bytes(&self) -> u64 {
        self.buffers().map(Buffer::byte_size).sum()
    }

    /// Buffers in item-then-buffer order
    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.items.iter().flat_map(|item| item.buffers.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_count() == 0
    }
}

// =============================================================================
// Host boundary
// =============================================================================

/// Read side of a caller-owned entry handle (used by insert)
pub trait EntrySource {
    /// Number of items
    fn item_count(&self) -> usize;

    /// Number of buffers in item `item`
    fn buffer_count(&self, item: usize) -> usize;

    /// Buffer `index` of item `item`
    fn buffer(&self, item: usize, index: usize) -> Result<Buffer>;
}

/// Write side of a caller-owned entry handle (fed by lookup)
pub trait EntrySink {
    /// Open a new item; subsequent buffers are appended to it
    fn begin_item(&mut self);

    /// Append a buffer to the most recently opened item
    fn push_buffer(&mut self, data: Bytes, attributes: BufferAttributes) -> Result<()>;
}

impl EntrySource for Entry {
    fn item_count(&self) -> usize {
        self.items.len()
    }

    fn buffer_count(&self, item: usize) -> usize {
        self.items.get(item).map_or(0, Item::len)
    }

    fn buffer(&self, item: usize, index: usize) -> Result<Buffer> {
        self.items
            .get(item)
            .and_then(|it| it.buffers.get(index))
            .cloned()
            .ok_or_else(|| Error::invalid(format!("no buffer {} in item {}", index, item)))
    }
}

impl EntrySink for Entry {
    fn begin_item(&mut self) {
        self.items.push(Item::new());
    }

    fn push_buffer(&mut self, data: Bytes, attributes: BufferAttributes) -> Result<()> {
        if data.len() as u64 != attributes.byte_size {
            return Err(Error::internal(format!(
                "buffer byte size {} does not match payload length {}",
                attributes.byte_size,
                data.len()
            )));
        }
        let item = self
            .items
            .last_mut()
            .ok_or_else(|| Error::internal("buffer appended before any item was opened"))?;
        item.push(Buffer::with_memory(
            data,
            attributes.memory_kind,
            attributes.memory_device_id,
        ));
        Ok(())
    }
}

/// Copy any [`EntrySource`] into an owned [`Entry`]
pub fn collect_entry<S: EntrySource + ?Sized>(source: &S) -> Result<Entry> {
    let mut entry = Entry::new();
    for item in 0..source.item_count() {
        let count = source.buffer_count(item);
        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            buffers.push(source.buffer(item, index)?);
        }
        entry.push_item(Item::from_buffers(buffers));
    }
    Ok(entry)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_memory_kind_roundtrip_values() {
        assert_eq!(MemoryKind::Cpu.as_i32(), 0);
        assert_eq!(MemoryKind::CpuPinned.as_i32(), 1);
        assert_eq!(MemoryKind::Gpu.as_i32(), 2);
        assert_eq!(MemoryKind::try_from(1).unwrap(), MemoryKind::CpuPinned);
        assert_matches!(MemoryKind::try_from(7), Err(Error::Internal(_)));
    }

    #[test]
    fn test_memory_kind_cacheable() {
        assert!(MemoryKind::Cpu.is_cacheable());
        assert!(MemoryKind::CpuPinned.is_cacheable());
        assert!(!MemoryKind::Gpu.is_cacheable());
    }

    #[test]
    fn test_buffer_validate() {
        assert!(Buffer::new(&b"abc"[..]).validate().is_ok());
        assert_matches!(
            Buffer::new(Bytes::new()).validate(),
            Err(Error::Internal(msg)) if msg.contains("zero")
        );
        assert_matches!(
            Buffer::with_memory(&b"abc"[..], MemoryKind::Gpu, 1).validate(),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_entry_counts() {
        let entry = Entry::from_items(vec![
            Item::from_buffers(vec![Buffer::new(&b"ab"[..]), Buffer::new(&b"cde"[..])]),
            Item::new(),
            Item::from_buffers(vec![Buffer::new(&b"f"[..])]),
        ]);
        assert_eq!(entry.item_count(), 3);
        assert_eq!(entry.buffer_count(), 3);
        assert_eq!(entry.total_bytes(), 6);

        let flat: Vec<&[u8]> = entry.buffers().map(|b| b.data().as_ref()).collect();
        assert_eq!(flat, vec![&b"ab"[..], &b"cde"[..], &b"f"[..]]);
    }

    #[test]
    fn test_entry_sink_requires_open_item() {
        let mut entry = Entry::new();
        let attrs = Buffer::new(&b"x"[..]).attributes();
        assert_matches!(
            entry.push_buffer(Bytes::from_static(b"x"), attrs),
            Err(Error::Internal(_))
        );

        entry.begin_item();
        entry.push_buffer(Bytes::from_static(b"x"), attrs).unwrap();
        assert_eq!(entry.buffer_count(), 1);
    }

    #[test]
    fn test_entry_sink_rejects_size_mismatch() {
        let mut entry = Entry::new();
        entry.begin_item();
        let attrs = BufferAttributes {
            byte_size: 4,
            memory_kind: MemoryKind::Cpu,
            memory_device_id: 0,
        };
        assert_matches!(
            entry.push_buffer(Bytes::from_static(b"abc"), attrs),
            Err(Error::Internal(_))
        );
    }

    #[test]
    fn test_collect_entry_from_source() {
        let entry = Entry::from_items(vec![
            Item::from_buffers(vec![Buffer::with_memory(&b"a"[..], MemoryKind::CpuPinned, 3)]),
            Item::from_buffers(vec![Buffer::new(&b"b"[..])]),
        ]);
        let copy = collect_entry(&entry).unwrap();
        assert_eq!(copy, entry);
        assert_matches!(entry.buffer(5, 0), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_buffer_debug_hides_payload() {
        let debug = format!("{:?}", Buffer::new(&b"secret"[..]));
        assert!(debug.contains("byte_size"));
        assert!(!debug.contains("secret"));
    }
}
