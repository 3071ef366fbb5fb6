//! Pack reader

use crate::error::{PackError, Result};
use crate::strid::StringId;
use crate::varint;
use crate::{Pack, PackType};

/// Per-field read options.
///
/// `default_value` is returned when the field turns out to be an id gap.
/// Defaults applied while writing must be applied again here since they are
/// not stored in the pack.
#[derive(Debug, Clone, Copy)]
pub struct ReadParam<T> {
    pub id: Option<u32>,
    pub default_value: T,
}

impl<T: Default> ReadParam<T> {
    pub fn new() -> Self {
        Self {
            id: None,
            default_value: T::default(),
        }
    }
}

impl<T: Default> Default for ReadParam<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadParam<T> {
    /// Read at an explicit field id, skipping any fields before it.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn default_value(mut self, value: T) -> Self {
        self.default_value = value;
        self
    }
}

/// A parsed field header waiting for its value to be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peeked {
    Field { id: u32, ty: PackType },
    End,
}

#[derive(Debug, Clone, Copy)]
struct ReadFrame {
    /// Last field id consumed or resolved in this container
    id_last: u32,
    /// Container type, `None` for the pack root
    container: Option<PackType>,
}

/// Sequential pack reader.
///
/// Typed reads resolve field ids the same way the writer assigned them;
/// a gap in the ids yields the caller-supplied default.
#[derive(Debug)]
pub struct PackRead<'a> {
    buffer: &'a [u8],
    pos: usize,
    frames: Vec<ReadFrame>,
    peeked: Option<Peeked>,
}

impl<'a> PackRead<'a> {
    pub fn new(pack: &'a Pack) -> Self {
        Self::from_slice(pack.as_slice())
    }

    /// Read pack bytes that arrived without the [`Pack`] wrapper, e.g. from
    /// a protocol frame.
    pub fn from_slice(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            pos: 0,
            frames: vec![ReadFrame {
                id_last: 0,
                container: None,
            }],
            peeked: None,
        }
    }

    fn frame(&self) -> ReadFrame {
        // The root frame is never popped
        #[allow(clippy::unwrap_used)]
        *self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut ReadFrame {
        #[allow(clippy::unwrap_used)]
        self.frames.last_mut().unwrap()
    }

    /// Parse the next field header without consuming its value.
    fn peek(&mut self) -> Result<Peeked> {
        if let Some(peeked) = self.peeked {
            return Ok(peeked);
        }

        // Reaching the end of the buffer without a terminator only happens
        // at the pack root, where the terminator may have been trimmed
        let peeked = if self.pos >= self.buffer.len() {
            Peeked::End
        } else {
            let delta = varint::read_u64(self.buffer, &mut self.pos)?;

            if delta == 0 {
                Peeked::End
            } else {
                if self.pos >= self.buffer.len() {
                    return Err(PackError::Format(
                        "buffer position is beyond buffer size".to_string(),
                    ));
                }

                let tag = self.buffer[self.pos];
                self.pos += 1;

                Peeked::Field {
                    id: self.frame().id_last + u32::try_from(delta).map_err(|_| {
                        PackError::Format(format!("field id delta {delta} out of range"))
                    })?,
                    ty: PackType::from_tag(tag)?,
                }
            }
        };

        self.peeked = Some(peeked);
        Ok(peeked)
    }

    /// True when another field exists in the current container. Use with
    /// [`PackRead::id`] and [`PackRead::field_type`] for dynamic structures
    /// such as arrays of unknown length.
    pub fn next(&mut self) -> Result<bool> {
        Ok(matches!(self.peek()?, Peeked::Field { .. }))
    }

    /// Field id of the pending field. Valid after [`PackRead::next`]
    /// returned true.
    pub fn id(&self) -> u32 {
        match self.peeked {
            Some(Peeked::Field { id, .. }) => id,
            _ => 0,
        }
    }

    /// Field type of the pending field. Valid after [`PackRead::next`]
    /// returned true.
    pub fn field_type(&self) -> Option<PackType> {
        match self.peeked {
            Some(Peeked::Field { ty, .. }) => Some(ty),
            _ => None,
        }
    }

    /// True when the next field is an id gap at `id` (or the next id). A
    /// NULL advances the id; a present field does not, since a typed read is
    /// expected to follow.
    pub fn is_null(&mut self, id: Option<u32>) -> Result<bool> {
        let target = id.unwrap_or(self.frame().id_last + 1);

        let null = match self.peek()? {
            Peeked::End => true,
            Peeked::Field { id, .. } => id > target,
        };

        if null {
            self.frame_mut().id_last = target;
        }

        Ok(null)
    }

    fn read_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = varint::read_u64(self.buffer, &mut self.pos)? as usize;

        if self.pos + len > self.buffer.len() {
            return Err(PackError::Format(
                "buffer position is beyond buffer size".to_string(),
            ));
        }

        let value = &self.buffer[self.pos..self.pos + len];
        self.pos += len;
        Ok(value)
    }

    /// Consume the value of a field whose header was already peeked.
    fn skip_value(&mut self, ty: PackType) -> Result<()> {
        match ty {
            PackType::U32
            | PackType::U64
            | PackType::I32
            | PackType::I64
            | PackType::Bool
            | PackType::Mode
            | PackType::Time
            | PackType::StrId
            | PackType::Ptr => {
                varint::read_u64(self.buffer, &mut self.pos)?;
            }
            PackType::Bin | PackType::Str | PackType::Pack => {
                self.read_len_prefixed()?;
            }
            PackType::Obj | PackType::Array => {
                // Skip nested fields until the container terminator
                loop {
                    let delta = varint::read_u64(self.buffer, &mut self.pos)?;

                    if delta == 0 {
                        break;
                    }

                    if self.pos >= self.buffer.len() {
                        return Err(PackError::Format(
                            "buffer position is beyond buffer size".to_string(),
                        ));
                    }

                    let tag = self.buffer[self.pos];
                    self.pos += 1;

                    self.skip_value(PackType::from_tag(tag)?)?;
                }
            }
        }

        Ok(())
    }

    /// Position at the field `target`, skipping earlier fields.
    ///
    /// Returns `None` when the field is an id gap (NULL); the caller then
    /// substitutes its default. Returns the field type otherwise, with the
    /// header consumed and the value pending.
    fn field_find(&mut self, target: u32) -> Result<Option<PackType>> {
        loop {
            match self.peek()? {
                Peeked::End => {
                    self.frame_mut().id_last = target;
                    return Ok(None);
                }
                Peeked::Field { id, ty } => {
                    if id > target {
                        // Gap: leave the peeked field for a later read
                        self.frame_mut().id_last = target;
                        return Ok(None);
                    }

                    self.peeked = None;

                    if id == target {
                        self.frame_mut().id_last = id;
                        return Ok(Some(ty));
                    }

                    // id < target: an unread field, skip it
                    self.frame_mut().id_last = id;
                    self.skip_value(ty)?;
                }
            }
        }
    }

    fn expect_type(found: PackType, expected: PackType, id: u32) -> Result<()> {
        if found == expected {
            Ok(())
        } else {
            Err(PackError::Format(format!(
                "field {id} is type '{}' but expected '{}'",
                found.name(),
                expected.name()
            )))
        }
    }

    fn read_uint(&mut self, expected: PackType, id: Option<u32>, default: u64) -> Result<u64> {
        let target = id.unwrap_or(self.frame().id_last + 1);

        match self.field_find(target)? {
            None => Ok(default),
            Some(ty) => {
                Self::expect_type(ty, expected, target)?;
                varint::read_u64(self.buffer, &mut self.pos)
            }
        }
    }

    fn read_int(&mut self, expected: PackType, id: Option<u32>, default: i64) -> Result<i64> {
        let target = id.unwrap_or(self.frame().id_last + 1);

        match self.field_find(target)? {
            None => Ok(default),
            Some(ty) => {
                Self::expect_type(ty, expected, target)?;
                Ok(varint::unzigzag(varint::read_u64(
                    self.buffer,
                    &mut self.pos,
                )?))
            }
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_u32_with(ReadParam::new())
    }

    pub fn read_u32_with(&mut self, param: ReadParam<u32>) -> Result<u32> {
        let value = self.read_uint(PackType::U32, param.id, u64::from(param.default_value))?;
        u32::try_from(value)
            .map_err(|_| PackError::Format(format!("u32 field value {value} out of range")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_u64_with(ReadParam::new())
    }

    pub fn read_u64_with(&mut self, param: ReadParam<u64>) -> Result<u64> {
        self.read_uint(PackType::U64, param.id, param.default_value)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_i32_with(ReadParam::new())
    }

    pub fn read_i32_with(&mut self, param: ReadParam<i32>) -> Result<i32> {
        let value = self.read_int(PackType::I32, param.id, i64::from(param.default_value))?;
        i32::try_from(value)
            .map_err(|_| PackError::Format(format!("i32 field value {value} out of range")))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_i64_with(ReadParam::new())
    }

    pub fn read_i64_with(&mut self, param: ReadParam<i64>) -> Result<i64> {
        self.read_int(PackType::I64, param.id, param.default_value)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_bool_with(ReadParam::new())
    }

    pub fn read_bool_with(&mut self, param: ReadParam<bool>) -> Result<bool> {
        let target = param.id.unwrap_or(self.frame().id_last + 1);

        match self.field_find(target)? {
            None => Ok(param.default_value),
            Some(ty) => {
                Self::expect_type(ty, PackType::Bool, target)?;
                Ok(varint::read_u64(self.buffer, &mut self.pos)? != 0)
            }
        }
    }

    pub fn read_mode(&mut self) -> Result<u32> {
        self.read_mode_with(ReadParam::new())
    }

    pub fn read_mode_with(&mut self, param: ReadParam<u32>) -> Result<u32> {
        let value = self.read_uint(PackType::Mode, param.id, u64::from(param.default_value))?;
        u32::try_from(value)
            .map_err(|_| PackError::Format(format!("mode field value {value} out of range")))
    }

    pub fn read_time(&mut self) -> Result<i64> {
        self.read_time_with(ReadParam::new())
    }

    pub fn read_time_with(&mut self, param: ReadParam<i64>) -> Result<i64> {
        self.read_int(PackType::Time, param.id, param.default_value)
    }

    pub fn read_strid(&mut self) -> Result<StringId> {
        self.read_strid_with(ReadParam::new())
    }

    pub fn read_strid_with(&mut self, param: ReadParam<Option<StringId>>) -> Result<StringId> {
        let target = param.id.unwrap_or(self.frame().id_last + 1);

        match self.field_find(target)? {
            None => param.default_value.ok_or_else(|| {
                PackError::Format(format!("field {target} is missing with no default"))
            }),
            Some(ty) => {
                Self::expect_type(ty, PackType::StrId, target)?;
                Ok(StringId::from_raw(varint::read_u64(
                    self.buffer,
                    &mut self.pos,
                )?))
            }
        }
    }

    /// Read a local pointer written on this host.
    pub fn read_ptr(&mut self) -> Result<usize> {
        let target = self.frame().id_last + 1;

        match self.field_find(target)? {
            None => Ok(0),
            Some(ty) => {
                Self::expect_type(ty, PackType::Ptr, target)?;
                Ok(varint::read_u64(self.buffer, &mut self.pos)? as usize)
            }
        }
    }

    pub fn read_str(&mut self) -> Result<String> {
        Ok(self.read_str_opt()?.unwrap_or_default())
    }

    /// Read an optional string; an id gap yields `None`.
    pub fn read_str_opt(&mut self) -> Result<Option<String>> {
        let target = self.frame().id_last + 1;

        match self.field_find(target)? {
            None => Ok(None),
            Some(ty) => {
                Self::expect_type(ty, PackType::Str, target)?;
                let bytes = self.read_len_prefixed()?;

                Ok(Some(String::from_utf8(bytes.to_vec()).map_err(|_| {
                    PackError::Format(format!("field {target} is not valid utf-8"))
                })?))
            }
        }
    }

    pub fn read_bin(&mut self) -> Result<Vec<u8>> {
        Ok(self.read_bin_opt()?.unwrap_or_default())
    }

    /// Read an optional binary blob; an id gap yields `None`.
    pub fn read_bin_opt(&mut self) -> Result<Option<Vec<u8>>> {
        let target = self.frame().id_last + 1;

        match self.field_find(target)? {
            None => Ok(None),
            Some(ty) => {
                Self::expect_type(ty, PackType::Bin, target)?;
                Ok(Some(self.read_len_prefixed()?.to_vec()))
            }
        }
    }

    /// Read an embedded pack; an id gap yields `None`.
    pub fn read_pack_opt(&mut self) -> Result<Option<Pack>> {
        let target = self.frame().id_last + 1;

        match self.field_find(target)? {
            None => Ok(None),
            Some(ty) => {
                Self::expect_type(ty, PackType::Pack, target)?;
                Ok(Some(Pack::from_vec(self.read_len_prefixed()?.to_vec())))
            }
        }
    }

    pub fn read_pack(&mut self) -> Result<Pack> {
        Ok(self.read_pack_opt()?.unwrap_or_default())
    }

    pub fn obj_begin(&mut self) -> Result<()> {
        self.container_begin(PackType::Obj, None)
    }

    pub fn obj_begin_id(&mut self, id: u32) -> Result<()> {
        self.container_begin(PackType::Obj, Some(id))
    }

    pub fn obj_end(&mut self) -> Result<()> {
        self.container_end(PackType::Obj)
    }

    pub fn array_begin(&mut self) -> Result<()> {
        self.container_begin(PackType::Array, None)
    }

    pub fn array_begin_id(&mut self, id: u32) -> Result<()> {
        self.container_begin(PackType::Array, Some(id))
    }

    pub fn array_end(&mut self) -> Result<()> {
        self.container_end(PackType::Array)
    }

    fn container_begin(&mut self, ty: PackType, id: Option<u32>) -> Result<()> {
        let target = id.unwrap_or(self.frame().id_last + 1);

        match self.field_find(target)? {
            None => Err(PackError::Format(format!(
                "container field {target} is missing"
            ))),
            Some(found) => {
                Self::expect_type(found, ty, target)?;
                self.frames.push(ReadFrame {
                    id_last: 0,
                    container: Some(ty),
                });
                Ok(())
            }
        }
    }

    fn container_end(&mut self, ty: PackType) -> Result<()> {
        if self.frame().container != Some(ty) {
            return Err(PackError::Assert(format!(
                "container end does not match begin in pack read at depth {}",
                self.frames.len()
            )));
        }

        // Skip any fields the caller did not read
        loop {
            match self.peek()? {
                Peeked::End => break,
                Peeked::Field { id, ty } => {
                    self.peeked = None;
                    self.frame_mut().id_last = id;
                    self.skip_value(ty)?;
                }
            }
        }

        self.peeked = None;
        self.frames.pop();
        Ok(())
    }

    /// Finish reading; remaining unread fields are skipped.
    pub fn end(&mut self) -> Result<()> {
        if self.frames.len() != 1 {
            return Err(PackError::Assert(format!(
                "pack read ended with {} unclosed container(s)",
                self.frames.len() - 1
            )));
        }

        loop {
            match self.peek()? {
                Peeked::End => break,
                Peeked::Field { id, ty } => {
                    self.peeked = None;
                    self.frame_mut().id_last = id;
                    self.skip_value(ty)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::write::{PackWrite, WriteParam};
    use pretty_assertions::assert_eq;

    #[test]
    fn worked_example() {
        // 1:u64:77, 2:bool:false (defaultWrite), gap at 3, 4:str:sample
        let mut write = PackWrite::new();
        write.write_u64(77).unwrap();
        write
            .write_bool_with(false, WriteParam::new().default_write())
            .unwrap();
        write
            .write_i32_with(-1, WriteParam::new().default_value(-1))
            .unwrap();
        write.write_str("sample").unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        assert_eq!(read.read_u64().unwrap(), 77);
        assert!(!read.read_bool().unwrap());
        assert_eq!(
            read.read_i32_with(ReadParam::new().default_value(-1)).unwrap(),
            -1
        );
        assert_eq!(read.read_str().unwrap(), "sample");
        read.end().unwrap();
    }

    #[test]
    fn present_ids_are_observable() {
        let mut write = PackWrite::new();
        write.write_u64(77).unwrap();
        write
            .write_bool_with(false, WriteParam::new().default_write())
            .unwrap();
        write
            .write_i32_with(-1, WriteParam::new().default_value(-1))
            .unwrap();
        write.write_str("sample").unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        let mut ids = Vec::new();

        while read.next().unwrap() {
            ids.push(read.id());
            let ty = read.field_type().unwrap();
            // Consume so the loop advances
            match ty {
                PackType::U64 => {
                    read.read_u64().unwrap();
                }
                PackType::Bool => {
                    read.read_bool().unwrap();
                }
                PackType::Str => {
                    read.read_str().unwrap();
                }
                _ => panic!("unexpected type"),
            }
        }

        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn gap_reads_as_none_then_field_reads() {
        let mut write = PackWrite::new();
        write.write_u64(77).unwrap();
        write
            .write_bool_with(false, WriteParam::new().default_write())
            .unwrap();
        write.write_null().unwrap();
        write.write_str("sample").unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        read.read_u64().unwrap();
        read.read_bool().unwrap();
        assert_eq!(read.read_str_opt().unwrap(), None); // id 3 is the gap
        assert_eq!(read.read_str().unwrap(), "sample");
        read.end().unwrap();
    }

    #[test]
    fn explicit_id_skips_unread_fields() {
        let mut write = PackWrite::new();
        write.write_u64(77).unwrap();
        write.write_u64(78).unwrap();
        write.write_u64(79).unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        assert_eq!(
            read.read_u64_with(ReadParam::new().id(3)).unwrap(),
            79
        );
        read.end().unwrap();
    }

    #[test]
    fn containers_reset_ids() {
        let mut write = PackWrite::new();
        write.write_u64(1).unwrap();
        write.array_begin().unwrap();
        write.write_u64(10).unwrap();
        write.write_u64(20).unwrap();
        write.array_end().unwrap();
        write.write_u64(2).unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        assert_eq!(read.read_u64().unwrap(), 1);
        read.array_begin().unwrap();
        assert_eq!(read.read_u64().unwrap(), 10);
        assert_eq!(read.read_u64().unwrap(), 20);
        read.array_end().unwrap();
        assert_eq!(read.read_u64().unwrap(), 2);
        read.end().unwrap();
    }

    #[test]
    fn nested_objects_round_trip() {
        let mut write = PackWrite::new();
        write.obj_begin().unwrap();
        write.write_str("inner").unwrap();
        write.write_u32(9).unwrap();
        write.obj_end().unwrap();
        write.write_bool(true).unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        read.obj_begin().unwrap();
        assert_eq!(read.read_str().unwrap(), "inner");
        assert_eq!(read.read_u32().unwrap(), 9);
        read.obj_end().unwrap();
        assert!(read.read_bool().unwrap());
        read.end().unwrap();
    }

    #[test]
    fn type_mismatch_errors() {
        let mut write = PackWrite::new();
        write.write_u64(7).unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        let err = read.read_str().unwrap_err();
        assert_eq!(
            err.to_string(),
            "field 1 is type 'u64' but expected 'str'"
        );
    }

    #[test]
    fn nested_pack_is_opaque() {
        let mut inner = PackWrite::new();
        inner.write_u64(42).unwrap();
        let inner = inner.end().unwrap();

        let mut write = PackWrite::new();
        write.write_pack(&inner).unwrap();
        write.write_str("after").unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        let inner_read = read.read_pack().unwrap();
        assert_eq!(read.read_str().unwrap(), "after");
        read.end().unwrap();

        let mut inner_read = PackRead::new(&inner_read);
        assert_eq!(inner_read.read_u64().unwrap(), 42);
    }

    #[test]
    fn strid_fields_round_trip() {
        let id = StringId::new("blk-incr");

        let mut write = PackWrite::new();
        write.write_strid(id).unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        assert_eq!(read.read_strid().unwrap(), id);
    }

    #[test]
    fn defaults_resolve_on_gaps() {
        let mut write = PackWrite::new();
        write.write_u64(0).unwrap(); // skipped, default
        write.write_u64(100).unwrap();
        let pack = write.end().unwrap();

        let mut read = PackRead::new(&pack);
        assert_eq!(read.read_u64().unwrap(), 0);
        assert_eq!(read.read_u64().unwrap(), 100);
    }
}
