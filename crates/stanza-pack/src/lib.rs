//! Compact typed binary encoding for repository and protocol data.
//!
//! The pack format encodes typed fields into a byte stream that is compact
//! enough for wire protocols and stable enough for on-disk structures such as
//! block maps. It is a stream format: fields are written and read in order,
//! identified by integer ids stored as deltas from the previous id.
//!
//! Key properties:
//!
//! - Integers use base-128 varint encoding, so endianness never matters.
//! - A NULL is a gap in the field ids; there is no null token. Readers
//!   supply a default value which is returned when the field is missing.
//! - Values equal to their default are not written unless explicitly
//!   requested, which keeps sparse records small.
//! - Containers (objects and arrays) reset the field id to one; closing a
//!   container restores the outer numbering.
//!
//! A simple pack:
//!
//! ```
//! use stanza_pack::{PackWrite, PackRead, WriteParam, ReadParam};
//!
//! let mut write = PackWrite::new();
//! write.write_u64(77).unwrap();
//! write.write_bool_with(false, WriteParam::new().default_write()).unwrap();
//! write.write_i32_with(-1, WriteParam::new().default_value(-1)).unwrap();
//! write.write_str("sample").unwrap();
//! let pack = write.end().unwrap();
//!
//! let mut read = PackRead::new(&pack);
//! assert_eq!(read.read_u64().unwrap(), 77);
//! assert!(!read.read_bool().unwrap());
//! assert_eq!(read.read_i32_with(ReadParam::new().default_value(-1)).unwrap(), -1);
//! assert_eq!(read.read_str().unwrap(), "sample");
//! read.end().unwrap();
//! ```

pub mod error;
pub mod read;
pub mod strid;
pub mod varint;
pub mod write;

pub use error::{PackError, Result};
pub use read::{PackRead, ReadParam};
pub use strid::StringId;
pub use write::{PackWrite, WriteParam};

/// An immutable, fully written pack buffer.
///
/// Produced by [`PackWrite::end`] and consumed by [`PackRead::new`]. The
/// bytes are self-describing and may be embedded in another pack as an
/// opaque field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pack(Vec<u8>);

impl Pack {
    /// Wrap raw pack bytes, e.g. read back from a repository file.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Pack {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Pack field data types.
///
/// The discriminant is the wire tag. Tags are stable: they are written to
/// disk inside block maps and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PackType {
    /// Array container begin
    Array = 1,
    /// Binary blob, length prefixed
    Bin = 2,
    /// Boolean
    Bool = 3,
    /// Signed 32-bit integer, zigzag varint
    I32 = 4,
    /// Signed 64-bit integer, zigzag varint
    I64 = 5,
    /// Object container begin
    Obj = 6,
    /// File mode bits
    Mode = 7,
    /// Nested pack, length prefixed and opaque to the outer stream
    Pack = 8,
    /// Local pointer. Never send to another host.
    Ptr = 9,
    /// String, length prefixed
    Str = 10,
    /// String id (see [`strid`])
    StrId = 11,
    /// Seconds since the epoch, zigzag varint
    Time = 12,
    /// Unsigned 32-bit integer, varint
    U32 = 13,
    /// Unsigned 64-bit integer, varint
    U64 = 14,
}

impl PackType {
    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => Self::Array,
            2 => Self::Bin,
            3 => Self::Bool,
            4 => Self::I32,
            5 => Self::I64,
            6 => Self::Obj,
            7 => Self::Mode,
            8 => Self::Pack,
            9 => Self::Ptr,
            10 => Self::Str,
            11 => Self::StrId,
            12 => Self::Time,
            13 => Self::U32,
            14 => Self::U64,
            _ => return Err(PackError::Format(format!("invalid pack type {tag}"))),
        })
    }

    /// Name used in type mismatch errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::Bin => "bin",
            Self::Bool => "bool",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Obj => "obj",
            Self::Mode => "mode",
            Self::Pack => "pack",
            Self::Ptr => "ptr",
            Self::Str => "str",
            Self::StrId => "strid",
            Self::Time => "time",
            Self::U32 => "u32",
            Self::U64 => "u64",
        }
    }
}
