//! Protocol session
//!
//! A typed request/response channel over a pair of byte streams. Requests
//! carry a command string id and a parameter pack; responses are a data
//! pack, an error (kind + message + stack) or a close marker. Storage
//! operations are dispatched by [`ProtocolServer`] against any
//! [`Storage`] implementation, which is how a repository on another host
//! is driven.
//!
//! Wire format: every frame is a varint length followed by pack bytes.
//! File content inside open-read/open-write commands flows as raw chunks
//! (varint length + bytes, zero terminator) between the frames.

use std::io::{Read, Write};

use tracing::{debug, trace};

use stanza_pack::{Pack, PackRead, PackWrite, StringId, varint};

use crate::error::{Result, StorageError};
use crate::{FileType, ReadParam, Storage, StorageFeature, StorageInfo, WriteParam};

/// Storage commands
pub const CMD_STORAGE_INFO: StringId = StringId::new("s-info");
pub const CMD_STORAGE_LIST: StringId = StringId::new("s-list");
pub const CMD_STORAGE_OPEN_READ: StringId = StringId::new("s-open-rd");
pub const CMD_STORAGE_OPEN_WRITE: StringId = StringId::new("s-open-wr");
pub const CMD_STORAGE_PATH_CREATE: StringId = StringId::new("s-path-cre");
pub const CMD_STORAGE_PATH_REMOVE: StringId = StringId::new("s-path-rm");
pub const CMD_STORAGE_PATH_SYNC: StringId = StringId::new("s-path-sync");
pub const CMD_STORAGE_REMOVE: StringId = StringId::new("s-remove");
pub const CMD_STORAGE_LINK_CREATE: StringId = StringId::new("s-link-cre");
pub const CMD_STORAGE_FEATURE: StringId = StringId::new("s-feature");

/// Session termination
pub const CMD_EXIT: StringId = StringId::new("exit");

/// Response kinds
const RESPONSE_DATA: StringId = StringId::new("data");
const RESPONSE_ERROR: StringId = StringId::new("error");
const RESPONSE_CLOSE: StringId = StringId::new("close");

fn frame_write(write: &mut impl Write, pack: &Pack) -> Result<()> {
    let mut header = Vec::with_capacity(varint::VARINT_MAX_SIZE);
    varint::write_u64(&mut header, pack.len() as u64);

    write.write_all(&header)?;
    write.write_all(pack.as_slice())?;
    write.flush()?;
    Ok(())
}

fn frame_read(read: &mut impl Read) -> Result<Pack> {
    let length = varint::read_u64_io(read)?;
    let mut data = vec![0u8; length as usize];
    read.read_exact(&mut data)?;
    Ok(Pack::from_vec(data))
}

/// Client end of a protocol session.
pub struct ProtocolClient<R: Read, W: Write> {
    name: String,
    read: R,
    write: W,
}

impl<R: Read, W: Write> ProtocolClient<R, W> {
    pub fn new(name: impl Into<String>, read: R, write: W) -> Self {
        Self {
            name: name.into(),
            read,
            write,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a request and return the peer's data response.
    pub fn request(&mut self, command: StringId, param: Option<&Pack>) -> Result<Pack> {
        trace!(session = %self.name, command = %command, "protocol request");

        let mut pack = PackWrite::new();
        pack.write_strid(command)?;
        pack.write_pack_opt(param)?;
        frame_write(&mut self.write, &pack.end()?)?;

        self.response()
    }

    /// Read one response frame, raising remote errors locally.
    pub fn response(&mut self) -> Result<Pack> {
        let frame = frame_read(&mut self.read)?;
        let mut read = PackRead::new(&frame);
        let kind = read.read_strid()?;

        if kind == RESPONSE_DATA {
            return Ok(read.read_pack()?);
        }

        if kind == RESPONSE_ERROR {
            let error_kind = read.read_str()?;
            let message = read.read_str()?;
            let stack = read.read_str()?;

            return Err(StorageError::Raised {
                session: self.name.clone(),
                kind: error_kind,
                message,
                stack,
            });
        }

        if kind == RESPONSE_CLOSE {
            return Err(StorageError::Execute(format!(
                "session '{}' closed unexpectedly",
                self.name
            )));
        }

        Err(StorageError::Execute(format!(
            "unknown response kind '{kind}' from session '{}'",
            self.name
        )))
    }

    /// Read one raw content chunk; `None` at the terminator.
    pub fn chunk_read(&mut self) -> Result<Option<Vec<u8>>> {
        let length = varint::read_u64_io(&mut self.read)?;

        if length == 0 {
            return Ok(None);
        }

        let mut data = vec![0u8; length as usize];
        self.read.read_exact(&mut data)?;
        Ok(Some(data))
    }

    /// Write one raw content chunk.
    pub fn chunk_write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut header = Vec::with_capacity(varint::VARINT_MAX_SIZE);
        varint::write_u64(&mut header, data.len() as u64);
        self.write.write_all(&header)?;
        self.write.write_all(data)?;
        Ok(())
    }

    /// Write the chunk terminator and flush.
    pub fn chunk_write_done(&mut self) -> Result<()> {
        self.write.write_all(&[0])?;
        self.write.flush()?;
        Ok(())
    }

    /// End the session; the peer responds with a close marker.
    pub fn exit(&mut self) -> Result<()> {
        let mut pack = PackWrite::new();
        pack.write_strid(CMD_EXIT)?;
        frame_write(&mut self.write, &pack.end()?)?;

        let frame = frame_read(&mut self.read)?;
        let mut read = PackRead::new(&frame);

        if read.read_strid()? != RESPONSE_CLOSE {
            return Err(StorageError::Execute(format!(
                "session '{}' did not acknowledge exit",
                self.name
            )));
        }

        Ok(())
    }
}

/// Server end of a protocol session, dispatching storage commands against
/// a local driver.
pub struct ProtocolServer<R: Read, W: Write, S: Storage> {
    name: String,
    read: R,
    write: W,
    storage: S,
}

impl<R: Read, W: Write, S: Storage> ProtocolServer<R, W, S> {
    pub fn new(name: impl Into<String>, read: R, write: W, storage: S) -> Self {
        Self {
            name: name.into(),
            read,
            write,
            storage,
        }
    }

    fn respond_data(&mut self, payload: &Pack) -> Result<()> {
        let mut pack = PackWrite::new();
        pack.write_strid(RESPONSE_DATA)?;
        pack.write_pack(payload)?;
        frame_write(&mut self.write, &pack.end()?)
    }

    fn respond_error(&mut self, error: &StorageError) -> Result<()> {
        debug!(session = %self.name, %error, "protocol command failed");

        let mut pack = PackWrite::new();
        pack.write_strid(RESPONSE_ERROR)?;
        pack.write_str(error.kind())?;
        pack.write_str(&error.to_string())?;
        pack.write_str(&std::backtrace::Backtrace::capture().to_string())?;
        frame_write(&mut self.write, &pack.end()?)
    }

    fn respond_close(&mut self) -> Result<()> {
        let mut pack = PackWrite::new();
        pack.write_strid(RESPONSE_CLOSE)?;
        frame_write(&mut self.write, &pack.end()?)
    }

    /// Serve requests until the peer exits or the stream closes.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let frame = match frame_read(&mut self.read) {
                Ok(frame) => frame,
                Err(StorageError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            let mut read = PackRead::new(&frame);
            let command = read.read_strid()?;
            let param = read.read_pack_opt()?;

            trace!(session = %self.name, command = %command, "protocol dispatch");

            if command == CMD_EXIT {
                self.respond_close()?;
                return Ok(());
            }

            match self.dispatch(command, param.as_ref()) {
                Ok(()) => {}
                Err(err) => self.respond_error(&err)?,
            }
        }
    }

    /// Handle one command, sending its data response.
    ///
    /// Open-read and open-write run their content streams inline, so any
    /// error before the stream starts is reported cleanly.
    fn dispatch(&mut self, command: StringId, param: Option<&Pack>) -> Result<()> {
        let mut param_read = param.map(PackRead::new);
        let param = &mut param_read;

        if command == CMD_STORAGE_INFO {
            let (path, follow_link) = {
                let read = require(param)?;
                (read.read_str()?, read.read_bool()?)
            };

            let info = self.storage.info(&path, follow_link)?;
            let payload = info_pack(&info)?;
            self.respond_data(&payload)
        } else if command == CMD_STORAGE_LIST {
            let path = require(param)?.read_str()?;
            let names = self.storage.list(&path)?;

            let mut pack = PackWrite::new();
            pack.array_begin()?;
            for name in &names {
                pack.write_str(name)?;
            }
            pack.array_end()?;
            self.respond_data(&pack.end()?)
        } else if command == CMD_STORAGE_OPEN_READ {
            let (path, ignore_missing, offset, limit, has_limit) = {
                let read = require(param)?;
                (
                    read.read_str()?,
                    read.read_bool()?,
                    read.read_u64()?,
                    read.read_u64()?,
                    read.read_bool()?,
                )
            };

            let mut read_param = ReadParam::new().offset(offset);
            read_param.ignore_missing = ignore_missing;
            if has_limit {
                read_param.limit = Some(limit);
            }

            let reader = self.storage.new_read(&path, read_param)?;

            let mut pack = PackWrite::new();
            pack.write_bool(reader.is_some())?;
            self.respond_data(&pack.end()?)?;

            if let Some(mut reader) = reader {
                let mut buffer = vec![0u8; 64 * 1024];
                let mut read_error = None;

                loop {
                    let read_size = match reader.read(&mut buffer) {
                        Ok(read_size) => read_size,
                        Err(source) => {
                            // Terminate the chunk stream first so the
                            // session stays in sync; the error follows as
                            // the trailing status response
                            read_error = Some(StorageError::FileRead {
                                path: path.clone(),
                                source,
                            });
                            break;
                        }
                    };

                    if read_size == 0 {
                        break;
                    }

                    let mut header = Vec::with_capacity(varint::VARINT_MAX_SIZE);
                    varint::write_u64(&mut header, read_size as u64);
                    self.write.write_all(&header)?;
                    self.write.write_all(&buffer[..read_size])?;
                }

                self.write.write_all(&[0])?;
                self.write.flush()?;

                match read_error {
                    Some(err) => self.respond_error(&err)?,
                    None => self.respond_data(&Pack::default())?,
                }
            }

            Ok(())
        } else if command == CMD_STORAGE_OPEN_WRITE {
            let (path, mode, time, atomic, create_path) = {
                let read = require(param)?;
                (
                    read.read_str()?,
                    read.read_u32()?,
                    read.read_time()?,
                    read.read_bool()?,
                    read.read_bool()?,
                )
            };

            let mut write_param = WriteParam::new();
            if mode != 0 {
                write_param.mode = Some(mode);
            }
            if time != 0 {
                write_param.time = Some(time);
            }
            write_param.atomic = atomic;
            write_param.create_path = create_path;

            let mut writer = self.storage.new_write(&path, write_param)?;

            // Ready for content
            self.respond_data(&Pack::default())?;

            // On a write failure the remaining chunks must still be
            // drained or the next request frame would land mid-stream
            let mut write_error = None;

            loop {
                let length = varint::read_u64_io(&mut self.read)?;

                if length == 0 {
                    break;
                }

                let mut data = vec![0u8; length as usize];
                self.read.read_exact(&mut data)?;

                if write_error.is_none() {
                    if let Err(source) = writer.write_all(&data) {
                        write_error = Some(StorageError::FileWrite {
                            path: path.clone(),
                            source,
                        });
                    }
                }
            }

            match write_error {
                Some(err) => Err(err),
                None => {
                    writer.close()?;
                    self.respond_data(&Pack::default())
                }
            }
        } else if command == CMD_STORAGE_PATH_CREATE {
            let (path, error_on_exists, no_parent_create, mode) = {
                let read = require(param)?;
                (
                    read.read_str()?,
                    read.read_bool()?,
                    read.read_bool()?,
                    read.read_mode()?,
                )
            };

            self.storage
                .path_create(&path, error_on_exists, no_parent_create, mode)?;
            self.respond_data(&Pack::default())
        } else if command == CMD_STORAGE_PATH_REMOVE {
            let (path, recurse) = {
                let read = require(param)?;
                (read.read_str()?, read.read_bool()?)
            };

            let removed = self.storage.path_remove(&path, recurse)?;

            let mut pack = PackWrite::new();
            pack.write_bool(removed)?;
            self.respond_data(&pack.end()?)
        } else if command == CMD_STORAGE_PATH_SYNC {
            let path = require(param)?.read_str()?;
            self.storage.path_sync(&path)?;
            self.respond_data(&Pack::default())
        } else if command == CMD_STORAGE_REMOVE {
            let (path, error_on_missing) = {
                let read = require(param)?;
                (read.read_str()?, read.read_bool()?)
            };

            self.storage.remove(&path, error_on_missing)?;
            self.respond_data(&Pack::default())
        } else if command == CMD_STORAGE_LINK_CREATE {
            let (target, link_path) = {
                let read = require(param)?;
                (read.read_str()?, read.read_str()?)
            };

            self.storage.link_create(&target, &link_path)?;
            self.respond_data(&Pack::default())
        } else if command == CMD_STORAGE_FEATURE {
            let feature = require(param)?.read_u32()?;
            let supported = match feature {
                0 => self.storage.feature(StorageFeature::Compress),
                1 => self.storage.feature(StorageFeature::AtomicWrite),
                _ => false,
            };

            let mut pack = PackWrite::new();
            pack.write_bool(supported)?;
            self.respond_data(&pack.end()?)
        } else {
            Err(StorageError::Execute(format!(
                "unknown command '{command}'"
            )))
        }
    }
}

fn require<'a, 'b>(
    param: &'a mut Option<PackRead<'b>>,
) -> Result<&'a mut PackRead<'b>> {
    param
        .as_mut()
        .ok_or_else(|| StorageError::Execute("command parameter missing".to_string()))
}

fn info_pack(info: &StorageInfo) -> Result<Pack> {
    let mut pack = PackWrite::new();
    pack.write_bool(info.exists)?;
    pack.write_u32(file_type_id(info.file_type))?;
    pack.write_u64(info.size)?;
    pack.write_time(info.time)?;
    pack.write_mode(info.mode)?;
    pack.write_str_opt(info.user.as_deref())?;
    pack.write_str_opt(info.group.as_deref())?;
    pack.write_str_opt(info.link_target.as_deref())?;
    Ok(pack.end()?)
}

pub(crate) fn info_unpack(pack: &Pack) -> Result<StorageInfo> {
    let mut read = PackRead::new(pack);

    Ok(StorageInfo {
        exists: read.read_bool()?,
        file_type: match read.read_u32()? {
            1 => FileType::Path,
            2 => FileType::Link,
            3 => FileType::Special,
            _ => FileType::File,
        },
        size: read.read_u64()?,
        time: read.read_time()?,
        mode: read.read_mode()?,
        user: read.read_str_opt()?,
        group: read.read_str_opt()?,
        link_target: read.read_str_opt()?,
    })
}

pub(crate) fn file_type_id(file_type: FileType) -> u32 {
    match file_type {
        FileType::File => 0,
        FileType::Path => 1,
        FileType::Link => 2,
        FileType::Special => 3,
    }
}
