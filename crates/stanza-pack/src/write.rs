//! Pack writer

use crate::error::{PackError, Result};
use crate::strid::StringId;
use crate::varint;
use crate::{Pack, PackType};

/// Per-field write options.
///
/// `T` is the field's value type. By default a value equal to `T::default()`
/// is not written at all and becomes an id gap that the reader resolves back
/// to the default. `default_write` forces the write anyway and
/// `default_value` changes which value is considered the default.
#[derive(Debug, Clone, Copy)]
pub struct WriteParam<T> {
    pub id: Option<u32>,
    pub default_write: bool,
    pub default_value: T,
}

impl<T: Default> WriteParam<T> {
    pub fn new() -> Self {
        Self {
            id: None,
            default_write: false,
            default_value: T::default(),
        }
    }
}

impl<T: Default> Default for WriteParam<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WriteParam<T> {
    /// Write with an explicit field id. The id must be greater than any id
    /// already written in the current container.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Write the field even when the value equals the default.
    pub fn default_write(mut self) -> Self {
        self.default_write = true;
        self
    }

    /// Change the default value for this field. The reader must supply the
    /// same default to recover the value from a gap.
    pub fn default_value(mut self, value: T) -> Self {
        self.default_value = value;
        self
    }
}

/// Tracks field numbering for one container level.
#[derive(Debug, Clone, Copy)]
struct WriteFrame {
    /// Last id physically written; deltas are relative to this
    id_last_written: u32,
    /// Next id assigned automatically
    id_next: u32,
    /// Container type, `None` for the pack root
    container: Option<PackType>,
}

impl WriteFrame {
    const fn new(container: Option<PackType>) -> Self {
        Self {
            id_last_written: 0,
            id_next: 1,
            container,
        }
    }
}

/// Incremental pack builder.
///
/// Fields are appended in id order; containers nest. [`PackWrite::end`]
/// finishes the pack and returns the bytes.
#[derive(Debug)]
pub struct PackWrite {
    buffer: Vec<u8>,
    frames: Vec<WriteFrame>,
}

impl PackWrite {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            frames: vec![WriteFrame::new(None)],
        }
    }

    /// Reserve capacity up front for packs with a known approximate size.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(size),
            frames: vec![WriteFrame::new(None)],
        }
    }

    fn frame_mut(&mut self) -> &mut WriteFrame {
        // The root frame is never popped
        #[allow(clippy::unwrap_used)]
        self.frames.last_mut().unwrap()
    }

    /// Resolve the field id, enforcing monotonic ordering.
    fn field_id(&mut self, id: Option<u32>) -> Result<u32> {
        let frame = self.frame_mut();
        let id = id.unwrap_or(frame.id_next);

        if id < frame.id_next {
            return Err(PackError::Assert(format!(
                "field {id} is not greater than last field {}",
                frame.id_next - 1
            )));
        }

        Ok(id)
    }

    /// Write the field header (id delta and type tag).
    fn field_begin(&mut self, ty: PackType, id: Option<u32>) -> Result<()> {
        let id = self.field_id(id)?;
        let frame = self.frame_mut();
        let delta = id - frame.id_last_written;

        frame.id_last_written = id;
        frame.id_next = id + 1;

        varint::write_u64(&mut self.buffer, u64::from(delta));
        self.buffer.push(ty as u8);

        Ok(())
    }

    /// Consume the field id without writing anything, leaving a gap.
    fn field_skip(&mut self, id: Option<u32>) -> Result<()> {
        let id = self.field_id(id)?;
        self.frame_mut().id_next = id + 1;
        Ok(())
    }

    /// Write an explicit NULL, i.e. skip one field id.
    pub fn write_null(&mut self) -> Result<&mut Self> {
        self.field_skip(None)?;
        Ok(self)
    }

    fn write_uint(&mut self, ty: PackType, value: u64, param: WriteParam<u64>) -> Result<&mut Self> {
        if value == param.default_value && !param.default_write {
            self.field_skip(param.id)?;
        } else {
            self.field_begin(ty, param.id)?;
            varint::write_u64(&mut self.buffer, value);
        }

        Ok(self)
    }

    fn write_int(&mut self, ty: PackType, value: i64, param: WriteParam<i64>) -> Result<&mut Self> {
        if value == param.default_value && !param.default_write {
            self.field_skip(param.id)?;
        } else {
            self.field_begin(ty, param.id)?;
            varint::write_u64(&mut self.buffer, varint::zigzag(value));
        }

        Ok(self)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<&mut Self> {
        self.write_u32_with(value, WriteParam::new())
    }

    pub fn write_u32_with(&mut self, value: u32, param: WriteParam<u32>) -> Result<&mut Self> {
        self.write_uint(
            PackType::U32,
            u64::from(value),
            WriteParam {
                id: param.id,
                default_write: param.default_write,
                default_value: u64::from(param.default_value),
            },
        )
    }

    pub fn write_u64(&mut self, value: u64) -> Result<&mut Self> {
        self.write_u64_with(value, WriteParam::new())
    }

    pub fn write_u64_with(&mut self, value: u64, param: WriteParam<u64>) -> Result<&mut Self> {
        self.write_uint(PackType::U64, value, param)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<&mut Self> {
        self.write_i32_with(value, WriteParam::new())
    }

    pub fn write_i32_with(&mut self, value: i32, param: WriteParam<i32>) -> Result<&mut Self> {
        self.write_int(
            PackType::I32,
            i64::from(value),
            WriteParam {
                id: param.id,
                default_write: param.default_write,
                default_value: i64::from(param.default_value),
            },
        )
    }

    pub fn write_i64(&mut self, value: i64) -> Result<&mut Self> {
        self.write_i64_with(value, WriteParam::new())
    }

    pub fn write_i64_with(&mut self, value: i64, param: WriteParam<i64>) -> Result<&mut Self> {
        self.write_int(PackType::I64, value, param)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<&mut Self> {
        self.write_bool_with(value, WriteParam::new())
    }

    pub fn write_bool_with(&mut self, value: bool, param: WriteParam<bool>) -> Result<&mut Self> {
        if value == param.default_value && !param.default_write {
            self.field_skip(param.id)?;
        } else {
            self.field_begin(PackType::Bool, param.id)?;
            varint::write_u64(&mut self.buffer, u64::from(value));
        }

        Ok(self)
    }

    /// Write file permission bits.
    pub fn write_mode(&mut self, value: u32) -> Result<&mut Self> {
        self.write_mode_with(value, WriteParam::new())
    }

    pub fn write_mode_with(&mut self, value: u32, param: WriteParam<u32>) -> Result<&mut Self> {
        self.write_uint(
            PackType::Mode,
            u64::from(value),
            WriteParam {
                id: param.id,
                default_write: param.default_write,
                default_value: u64::from(param.default_value),
            },
        )
    }

    /// Write seconds since the epoch.
    pub fn write_time(&mut self, value: i64) -> Result<&mut Self> {
        self.write_time_with(value, WriteParam::new())
    }

    pub fn write_time_with(&mut self, value: i64, param: WriteParam<i64>) -> Result<&mut Self> {
        self.write_int(PackType::Time, value, param)
    }

    pub fn write_strid(&mut self, value: StringId) -> Result<&mut Self> {
        self.write_strid_with(value, WriteParam::new())
    }

    pub fn write_strid_with(
        &mut self,
        value: StringId,
        param: WriteParam<Option<StringId>>,
    ) -> Result<&mut Self> {
        if param.default_value == Some(value) && !param.default_write {
            self.field_skip(param.id)?;
        } else {
            self.field_begin(PackType::StrId, param.id)?;
            varint::write_u64(&mut self.buffer, value.as_raw());
        }

        Ok(self)
    }

    /// Write a local pointer. Never send the resulting pack to another host.
    pub fn write_ptr(&mut self, value: usize) -> Result<&mut Self> {
        self.field_begin(PackType::Ptr, None)?;
        varint::write_u64(&mut self.buffer, value as u64);
        Ok(self)
    }

    pub fn write_str(&mut self, value: &str) -> Result<&mut Self> {
        self.write_str_opt(Some(value))
    }

    /// Write an optional string; `None` leaves an id gap.
    pub fn write_str_opt(&mut self, value: Option<&str>) -> Result<&mut Self> {
        match value {
            None => {
                self.field_skip(None)?;
            }
            Some(value) => {
                self.field_begin(PackType::Str, None)?;
                varint::write_u64(&mut self.buffer, value.len() as u64);
                self.buffer.extend_from_slice(value.as_bytes());
            }
        }

        Ok(self)
    }

    pub fn write_bin(&mut self, value: &[u8]) -> Result<&mut Self> {
        self.write_bin_opt(Some(value))
    }

    /// Write an optional binary blob; `None` leaves an id gap.
    pub fn write_bin_opt(&mut self, value: Option<&[u8]>) -> Result<&mut Self> {
        match value {
            None => {
                self.field_skip(None)?;
            }
            Some(value) => {
                self.field_begin(PackType::Bin, None)?;
                varint::write_u64(&mut self.buffer, value.len() as u64);
                self.buffer.extend_from_slice(value);
            }
        }

        Ok(self)
    }

    /// Embed a complete pack as an opaque field.
    pub fn write_pack(&mut self, value: &Pack) -> Result<&mut Self> {
        self.write_pack_opt(Some(value))
    }

    pub fn write_pack_opt(&mut self, value: Option<&Pack>) -> Result<&mut Self> {
        match value {
            None => {
                self.field_skip(None)?;
            }
            Some(value) => {
                self.field_begin(PackType::Pack, None)?;
                varint::write_u64(&mut self.buffer, value.len() as u64);
                self.buffer.extend_from_slice(value.as_slice());
            }
        }

        Ok(self)
    }

    /// Begin an object. Field numbering restarts at one inside.
    pub fn obj_begin(&mut self) -> Result<&mut Self> {
        self.container_begin(PackType::Obj, None)
    }

    pub fn obj_begin_id(&mut self, id: u32) -> Result<&mut Self> {
        self.container_begin(PackType::Obj, Some(id))
    }

    pub fn obj_end(&mut self) -> Result<&mut Self> {
        self.container_end(PackType::Obj)
    }

    /// Begin an array. Elements are fields with sequential ids.
    pub fn array_begin(&mut self) -> Result<&mut Self> {
        self.container_begin(PackType::Array, None)
    }

    pub fn array_begin_id(&mut self, id: u32) -> Result<&mut Self> {
        self.container_begin(PackType::Array, Some(id))
    }

    pub fn array_end(&mut self) -> Result<&mut Self> {
        self.container_end(PackType::Array)
    }

    fn container_begin(&mut self, ty: PackType, id: Option<u32>) -> Result<&mut Self> {
        self.field_begin(ty, id)?;
        self.frames.push(WriteFrame::new(Some(ty)));
        Ok(self)
    }

    fn container_end(&mut self, ty: PackType) -> Result<&mut Self> {
        let frame = self.frame_mut();

        if frame.container != Some(ty) {
            return Err(PackError::Assert(format!(
                "container end does not match begin in pack write at depth {}",
                self.frames.len()
            )));
        }

        self.buffer.push(0);
        self.frames.pop();
        Ok(self)
    }

    /// Finish the pack: write the terminator and return the bytes.
    pub fn end(mut self) -> Result<Pack> {
        if self.frames.len() != 1 {
            return Err(PackError::Assert(format!(
                "pack write ended with {} unclosed container(s)",
                self.frames.len() - 1
            )));
        }

        self.buffer.push(0);
        Ok(Pack(self.buffer))
    }
}

impl Default for PackWrite {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_skipped() {
        let mut write = PackWrite::new();
        write.write_u64(0).unwrap();
        write.write_u64(5).unwrap();
        let pack = write.end().unwrap();

        // One field header (delta 2, tag), one value byte, one terminator
        assert_eq!(pack.as_slice(), &[2, PackType::U64 as u8, 5, 0]);
    }

    #[test]
    fn default_write_forces_field() {
        let mut write = PackWrite::new();
        write
            .write_bool_with(false, WriteParam::new().default_write())
            .unwrap();
        let pack = write.end().unwrap();

        assert_eq!(pack.as_slice(), &[1, PackType::Bool as u8, 0, 0]);
    }

    #[test]
    fn explicit_id_must_increase() {
        let mut write = PackWrite::new();
        write.write_u64_with(1, WriteParam::new().id(4)).unwrap();

        let err = write
            .write_u64_with(2, WriteParam::new().id(3))
            .unwrap_err();
        assert!(matches!(err, PackError::Assert(_)));
    }

    #[test]
    fn unclosed_container_errors_on_end() {
        let mut write = PackWrite::new();
        write.obj_begin().unwrap();
        assert!(matches!(write.end(), Err(PackError::Assert(_))));
    }

    #[test]
    fn mismatched_container_end_errors() {
        let mut write = PackWrite::new();
        write.obj_begin().unwrap();
        assert!(matches!(write.array_end(), Err(PackError::Assert(_))));
    }
}
