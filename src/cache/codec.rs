//! Entry Codec
//!
//! Lossless translation between an [`Entry`] and a flat [`FieldMap`] that any
//! field-oriented store (a Redis hash, the local arena index) can hold.
//!
//! # Layout (format version 1)
//!
//! ```text
//! key -> #:v  format version        0:b  payload of buffer 0
//!        #:n  buffer count          0:s  byte size of buffer 0
//!        #:l  item lengths "2,0,1"  0:t  memory kind of buffer 0
//!        #:z  total payload bytes   0:i  device id of buffer 0
//!                                   1:b  ...
//! ```
//!
//! Buffers are numbered in item-then-buffer order. The header occupies one
//! slot of [`FIELDS_PER_BUFFER`] fields so a well-formed record always has a
//! multiple of four fields. Records written without a header (version 0)
//! decode into a single item.

use std::collections::BTreeMap;
use std::str::FromStr;

use bytes::Bytes;

use super::entry::{BufferAttributes, Entry, EntrySink, MemoryKind};
use super::FIELDS_PER_BUFFER;
use crate::error::{Error, Result};

/// Flat field-name to field-value representation of an entry
pub type FieldMap = BTreeMap<String, Bytes>;

/// Current layout version written by [`encode`]
pub const FORMAT_VERSION: u32 = 1;

/// Header field holding the layout version
pub const HEADER_VERSION: &str = "#:v";
/// Header field holding the buffer count
pub const HEADER_COUNT: &str = "#:n";
/// Header field holding comma separated per-item buffer counts
pub const HEADER_ITEMS: &str = "#:l";
/// Header field holding the payload total
pub const HEADER_BYTES: &str = "#:z";

const HEADER_FIELDS: [&str; FIELDS_PER_BUFFER] =
    [HEADER_VERSION, HEADER_COUNT, HEADER_ITEMS, HEADER_BYTES];

const INCOMPLETE: &str = "encountered incomplete cache result";

/// The four per-buffer fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferField {
    /// Raw payload bytes
    Payload,
    /// Byte size, decimal
    ByteSize,
    /// Memory kind, decimal
    MemoryKind,
    /// Device id, decimal
    DeviceId,
}

impl BufferField {
    pub const ALL: [BufferField; FIELDS_PER_BUFFER] = [
        BufferField::Payload,
        BufferField::ByteSize,
        BufferField::MemoryKind,
        BufferField::DeviceId,
    ];

    fn suffix(self) -> char {
        match self {
            BufferField::Payload => 'b',
            BufferField::ByteSize => 's',
            BufferField::MemoryKind => 't',
            BufferField::DeviceId => 'i',
        }
    }

    /// Field name for buffer `index`
    pub fn name(self, index: usize) -> String {
        format!("{}:{}", index, self.suffix())
    }

    /// Whether `field` names a payload field
    pub fn is_payload(field: &str) -> bool {
        field.ends_with(":b") && !field.starts_with('#')
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode an entry, validating every buffer before producing any field
pub fn encode(entry: &Entry) -> Result<FieldMap> {
    if entry.buffer_count() == 0 {
        return Err(Error::internal("cannot cache an entry without buffers"));
    }
    for buffer in entry.buffers() {
        buffer.validate()?;
    }

    let mut fields = FieldMap::new();
    for (index, buffer) in entry.buffers().enumerate() {
        fields.insert(BufferField::Payload.name(index), buffer.data().clone());
        fields.insert(
            BufferField::ByteSize.name(index),
            decimal(buffer.byte_size()),
        );
        fields.insert(
            BufferField::MemoryKind.name(index),
            decimal(buffer.memory_kind().as_i32()),
        );
        fields.insert(
            BufferField::DeviceId.name(index),
            decimal(buffer.memory_device_id()),
        );
    }

    let lengths = entry
        .items()
        .iter()
        .map(|item| item.len().to_string())
        .collect::<Vec<_>>()
        .join(",");
    fields.insert(HEADER_VERSION.to_string(), decimal(FORMAT_VERSION));
    fields.insert(HEADER_COUNT.to_string(), decimal(entry.buffer_count()));
    fields.insert(HEADER_ITEMS.to_string(), Bytes::from(lengths));
    fields.insert(HEADER_BYTES.to_string(), decimal(entry.total_bytes()));

    debug_assert_eq!(fields.len() % FIELDS_PER_BUFFER, 0);
    Ok(fields)
}

fn decimal(value: impl ToString) -> Bytes {
    Bytes::from(value.to_string())
}

// =============================================================================
// Decoding
// =============================================================================

/// Shape recorded in the header
#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    buffer_count: usize,
    item_lengths: Vec<usize>,
    total_bytes: Option<u64>,
}

/// Decode a field map into a fresh entry
pub fn decode(fields: &FieldMap) -> Result<Entry> {
    let mut entry = Entry::new();
    decode_into(fields, &mut entry)?;
    Ok(entry)
}

/// Decode a field map into a caller supplied sink
///
/// The whole record is validated before the sink sees anything, so an error
/// never leaves a partially populated sink behind. Returns the number of
/// buffers delivered.
pub fn decode_into<S: EntrySink + ?Sized>(fields: &FieldMap, sink: &mut S) -> Result<usize> {
    if fields.len() % FIELDS_PER_BUFFER != 0 {
        return Err(Error::internal(INCOMPLETE));
    }

    let header = read_header(fields)?;
    let mut buffers = Vec::with_capacity(header.buffer_count);
    let mut total = 0u64;
    for index in 0..header.buffer_count {
        let (data, attributes) = read_buffer(fields, index)?;
        total += attributes.byte_size;
        buffers.push((data, attributes));
    }
    if let Some(expected) = header.total_bytes {
        if expected != total {
            return Err(Error::internal(format!(
                "cache result payload totals {} bytes, header records {}",
                total, expected
            )));
        }
    }

    let mut buffers = buffers.into_iter();
    for len in &header.item_lengths {
        sink.begin_item();
        for (data, attributes) in buffers.by_ref().take(*len) {
            sink.push_buffer(data, attributes)?;
        }
    }
    Ok(header.buffer_count)
}

fn read_header(fields: &FieldMap) -> Result<Header> {
    let present = HEADER_FIELDS
        .iter()
        .filter(|name| fields.contains_key(**name))
        .count();

    if present == 0 {
        // version 0: no header, every buffer in one item
        let buffer_count = fields.len() / FIELDS_PER_BUFFER;
        let item_lengths = if buffer_count == 0 {
            Vec::new()
        } else {
            vec![buffer_count]
        };
        return Ok(Header {
            buffer_count,
            item_lengths,
            total_bytes: None,
        });
    }
    if present != FIELDS_PER_BUFFER {
        return Err(Error::internal(INCOMPLETE));
    }

    let version: u32 = parse(fields, HEADER_VERSION)?;
    if version != FORMAT_VERSION {
        return Err(Error::internal(format!(
            "unsupported cache entry format version {}",
            version
        )));
    }

    let buffer_count: usize = parse(fields, HEADER_COUNT)?;
    let expected_fields = buffer_count
        .checked_add(1)
        .and_then(|slots| slots.checked_mul(FIELDS_PER_BUFFER));
    if expected_fields != Some(fields.len()) {
        return Err(Error::internal(INCOMPLETE));
    }

    let lengths = text(fields, HEADER_ITEMS)?;
    let item_lengths = if lengths.is_empty() {
        Vec::new()
    } else {
        lengths
            .split(',')
            .map(|len| {
                len.parse::<usize>().map_err(|_| {
                    Error::internal(format!("malformed item lengths field '{}'", lengths))
                })
            })
            .collect::<Result<Vec<_>>>()?
    };
    if item_lengths.iter().sum::<usize>() != buffer_count {
        return Err(Error::internal(format!(
            "item lengths '{}' do not add up to {} buffers",
            lengths, buffer_count
        )));
    }

    Ok(Header {
        buffer_count,
        item_lengths,
        total_bytes: Some(parse(fields, HEADER_BYTES)?),
    })
}

fn read_buffer(fields: &FieldMap, index: usize) -> Result<(Bytes, BufferAttributes)> {
    let names = BufferField::ALL.map(|field| field.name(index));
    if !names.iter().all(|name| fields.contains_key(name)) {
        return Err(Error::internal(INCOMPLETE));
    }

    let byte_size: u64 = parse(fields, &names[1])?;
    let kind: i32 = parse(fields, &names[2])?;
    let memory_device_id: i64 = parse(fields, &names[3])?;
    let data = fields[&names[0]].clone();

    if byte_size == 0 {
        return Err(Error::internal(format!("buffer {} has zero byte size", index)));
    }
    if data.len() as u64 != byte_size {
        return Err(Error::internal(format!(
            "buffer {} holds {} bytes but records {}",
            index,
            data.len(),
            byte_size
        )));
    }
    let memory_kind = MemoryKind::try_from(kind)?;
    if !memory_kind.is_cacheable() {
        return Err(Error::internal(format!(
            "buffer {} stored with non-CPU memory type {}",
            index, memory_kind
        )));
    }

    Ok((
        data,
        BufferAttributes {
            byte_size,
            memory_kind,
            memory_device_id,
        },
    ))
}

fn text<'a>(fields: &'a FieldMap, name: &str) -> Result<&'a str> {
    let raw = fields.get(name).ok_or_else(|| Error::internal(INCOMPLETE))?;
    std::str::from_utf8(raw)
        .map_err(|_| Error::internal(format!("field '{}' is not valid UTF-8", name)))
}

fn parse<T: FromStr>(fields: &FieldMap, name: &str) -> Result<T> {
    let raw = text(fields, name)?;
    raw.parse()
        .map_err(|_| Error::internal(format!("field '{}' has malformed value '{}'", name, raw)))
}

// =============================================================================
// Tests
// =============================================================================
