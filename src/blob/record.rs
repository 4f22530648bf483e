//! Record slot header codec.
//!
//! Every slot starts with a header describing itself, so the file can be walked
//! front to back without an index:
//!
//! ```text
//! Actual / Deleted   ┌─────┬───────┬──────────┬──────────────┬────────────┬────────────┐
//!                    │ tag │ flags │ reserved │ capacity u32 │ length u32 │ origin u32 │  16 bytes
//!                    └─────┴───────┴──────────┴──────────────┴────────────┴────────────┘
//! Moved              ┌─────┬───────┬──────────┬──────────────┬────────────┬────────────┐
//!                    │ tag │ flags │ reserved │ capacity u32 │ target u32 │ 0          │  16 bytes
//!                    └─────┴───────┴──────────┴──────────────┴────────────┴────────────┘
//! Padding            ┌─────┬──────────────────┬──────────────┐
//!                    │ tag │ reserved (3)     │ capacity u32 │                            8 bytes
//!                    └─────┴──────────────────┴──────────────┘
//! ```
//!
//! `origin` is set only on an `Actual` slot written by a relocation. It names
//! the slot the record was first allocated in, whose redirect always points at
//! the current location. 0 means the slot is its own origin.
//!
//! All integers are little-endian. A slot occupies `header + capacity` bytes
//! rounded up to [`RECORD_ALIGNMENT`].

use crate::blob::error::{BlobResult, BlobStorageError};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

pub const RECORD_ALIGNMENT: usize = 8;
pub const RECORD_HEADER_SIZE: usize = 16;
pub const PADDING_HEADER_SIZE: usize = 8;

const TAG_ACTUAL: u8 = 1;
const TAG_MOVED: u8 = 2;
const TAG_DELETED: u8 = 3;
const TAG_PADDING: u8 = 4;

/// Set on a `Deleted` slot that was a redirect before the record was deleted.
const FLAG_RELOCATED: u8 = 0b0000_0001;

const TAG_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const RESERVED_OFFSET: usize = 2;
const CAPACITY_OFFSET: usize = 4;
const LENGTH_OFFSET: usize = 8;
const ORIGIN_OFFSET: usize = 12;

/// Identifier of a record slot: its byte offset divided by [`RECORD_ALIGNMENT`].
///
/// Offset 0 holds the storage header, so 0 is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u32);

impl RecordId {
    pub fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(RecordId(raw))
    }

    pub fn from_offset(offset: u64) -> Option<Self> {
        if offset % RECORD_ALIGNMENT as u64 != 0 {
            return None;
        }
        let raw = u32::try_from(offset / RECORD_ALIGNMENT as u64).ok()?;
        Self::from_raw(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn offset(&self) -> u64 {
        self.0 as u64 * RECORD_ALIGNMENT as u64
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    Actual,
    Moved,
    Deleted,
    Padding,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordState::Actual => "actual",
            RecordState::Moved => "moved",
            RecordState::Deleted => "deleted",
            RecordState::Padding => "padding",
        };
        f.pad(name)
    }
}

/// Decoded slot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordHeader {
    Actual {
        capacity: u32,
        length: u32,
        origin: Option<RecordId>,
    },
    Moved {
        capacity: u32,
        target: RecordId,
    },
    Deleted {
        capacity: u32,
        length: u32,
        relocated: bool,
    },
    Padding {
        capacity: u32,
    },
}

impl RecordHeader {
    /// A freshly allocated record that is its own origin.
    pub fn actual(capacity: u32, length: u32) -> Self {
        RecordHeader::Actual {
            capacity,
            length,
            origin: None,
        }
    }

    pub fn state(&self) -> RecordState {
        match self {
            RecordHeader::Actual { .. } => RecordState::Actual,
            RecordHeader::Moved { .. } => RecordState::Moved,
            RecordHeader::Deleted { .. } => RecordState::Deleted,
            RecordHeader::Padding { .. } => RecordState::Padding,
        }
    }

    pub fn capacity(&self) -> u32 {
        match *self {
            RecordHeader::Actual { capacity, .. }
            | RecordHeader::Moved { capacity, .. }
            | RecordHeader::Deleted { capacity, .. }
            | RecordHeader::Padding { capacity } => capacity,
        }
    }

    pub fn redirect(&self) -> Option<RecordId> {
        match *self {
            RecordHeader::Moved { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn header_size(&self) -> usize {
        match self {
            RecordHeader::Padding { .. } => PADDING_HEADER_SIZE,
            _ => RECORD_HEADER_SIZE,
        }
    }

    /// Bytes the whole slot occupies, header included.
    pub fn slot_size(&self) -> usize {
        slot_size(self.header_size(), self.capacity() as usize)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.header_size()];
        let (tag, flags, last, origin) = match *self {
            RecordHeader::Actual { length, origin, .. } => {
                (TAG_ACTUAL, 0, Some(length), origin.map_or(0, |id| id.as_u32()))
            }
            RecordHeader::Moved { target, .. } => (TAG_MOVED, 0, Some(target.as_u32()), 0),
            RecordHeader::Deleted {
                length, relocated, ..
            } => {
                let flags = if relocated { FLAG_RELOCATED } else { 0 };
                (TAG_DELETED, flags, Some(length), 0)
            }
            RecordHeader::Padding { .. } => (TAG_PADDING, 0, None, 0),
        };
        buf[TAG_OFFSET] = tag;
        buf[FLAGS_OFFSET] = flags;
        LittleEndian::write_u32(&mut buf[CAPACITY_OFFSET..], self.capacity());
        if let Some(value) = last {
            LittleEndian::write_u32(&mut buf[LENGTH_OFFSET..], value);
            LittleEndian::write_u32(&mut buf[ORIGIN_OFFSET..], origin);
        }
        buf
    }

    /// Decodes the header of the slot at `offset`.
    ///
    /// `buf` may be shorter than [`RECORD_HEADER_SIZE`] only when the slot sits
    /// in the last bytes of a page, which only a padding slot can do.
    pub fn decode(offset: u64, buf: &[u8]) -> BlobResult<Self> {
        if buf.len() < PADDING_HEADER_SIZE {
            return Err(BlobStorageError::corruption(
                offset,
                format!("only {} bytes left for a record header", buf.len()),
            ));
        }

        let tag = buf[TAG_OFFSET];
        let capacity = LittleEndian::read_u32(&buf[CAPACITY_OFFSET..]);
        if tag == TAG_PADDING {
            if buf[FLAGS_OFFSET..CAPACITY_OFFSET].iter().any(|&b| b != 0) {
                return Err(BlobStorageError::corruption(offset, "padding header has non-zero reserved bytes"));
            }
            return Ok(RecordHeader::Padding { capacity });
        }

        if !matches!(tag, TAG_ACTUAL | TAG_MOVED | TAG_DELETED) {
            return Err(BlobStorageError::corruption(offset, format!("invalid state tag {tag}")));
        }
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(BlobStorageError::corruption(offset, "record header crosses page boundary"));
        }

        let flags = buf[FLAGS_OFFSET];
        let reserved = LittleEndian::read_u16(&buf[RESERVED_OFFSET..]);
        let allowed_flags = if tag == TAG_DELETED { FLAG_RELOCATED } else { 0 };
        if flags & !allowed_flags != 0 || reserved != 0 {
            return Err(BlobStorageError::corruption(
                offset,
                format!("unexpected flags {flags:#04x} / reserved {reserved:#06x}"),
            ));
        }

        let last = LittleEndian::read_u32(&buf[LENGTH_OFFSET..]);
        let origin = LittleEndian::read_u32(&buf[ORIGIN_OFFSET..]);
        if tag != TAG_ACTUAL && origin != 0 {
            return Err(BlobStorageError::corruption(offset, "origin set on a non-actual slot"));
        }
        if RecordId::from_raw(origin).is_some_and(|id| id.offset() >= offset) {
            return Err(BlobStorageError::corruption(
                offset,
                format!("origin #{origin} does not precede the slot"),
            ));
        }

        match tag {
            TAG_MOVED => {
                let target = RecordId::from_raw(last)
                    .ok_or_else(|| BlobStorageError::corruption(offset, "redirect to record id 0"))?;
                Ok(RecordHeader::Moved { capacity, target })
            }
            _ => {
                if capacity < last {
                    return Err(BlobStorageError::corruption(
                        offset,
                        format!("capacity {capacity} < actual length {last}"),
                    ));
                }
                if tag == TAG_ACTUAL {
                    Ok(RecordHeader::Actual {
                        capacity,
                        length: last,
                        origin: RecordId::from_raw(origin),
                    })
                } else {
                    Ok(RecordHeader::Deleted {
                        capacity,
                        length: last,
                        relocated: flags & FLAG_RELOCATED != 0,
                    })
                }
            }
        }
    }
}

pub fn slot_size(header_size: usize, capacity: usize) -> usize {
    align_up(header_size + capacity)
}

pub fn align_up(size: usize) -> usize {
    (size + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}
