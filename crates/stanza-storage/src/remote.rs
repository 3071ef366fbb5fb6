//! Remote storage driver
//!
//! Implements [`Storage`] over a [`ProtocolClient`] session, so a
//! repository served by a peer process looks identical to a local one.
//! The session is strictly sequential: while an open-read or open-write
//! stream is in flight no other command may be issued, which the
//! single-threaded engine guarantees by construction. A read stream must
//! be consumed to end-of-stream before the session is reused.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use stanza_pack::{PackRead, PackWrite};

use crate::error::Result;
use crate::protocol::{
    CMD_STORAGE_FEATURE, CMD_STORAGE_INFO, CMD_STORAGE_LINK_CREATE, CMD_STORAGE_LIST,
    CMD_STORAGE_OPEN_READ, CMD_STORAGE_OPEN_WRITE, CMD_STORAGE_PATH_CREATE,
    CMD_STORAGE_PATH_REMOVE, CMD_STORAGE_PATH_SYNC, CMD_STORAGE_REMOVE, ProtocolClient,
    info_unpack,
};
use crate::{
    ReadParam, Storage, StorageFeature, StorageInfo, StorageWrite, WriteParam,
};

type SharedClient<R, W> = Rc<RefCell<ProtocolClient<R, W>>>;

/// Storage driver that forwards every operation over a protocol session.
pub struct RemoteStorage<R: Read, W: Write> {
    client: SharedClient<R, W>,
}

impl<R: Read + 'static, W: Write + 'static> RemoteStorage<R, W> {
    pub fn new(client: ProtocolClient<R, W>) -> Self {
        Self {
            client: Rc::new(RefCell::new(client)),
        }
    }

    /// End the session.
    pub fn exit(&self) -> Result<()> {
        self.client.borrow_mut().exit()
    }
}

/// Read stream pulling content chunks from the session.
struct RemoteRead<R: Read, W: Write> {
    client: SharedClient<R, W>,
    chunk: Vec<u8>,
    chunk_pos: usize,
    done: bool,
}

impl<R: Read, W: Write> Read for RemoteRead<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.chunk_pos < self.chunk.len() {
                let available = &self.chunk[self.chunk_pos..];
                let copy = available.len().min(buf.len());
                buf[..copy].copy_from_slice(&available[..copy]);
                self.chunk_pos += copy;
                return Ok(copy);
            }

            if self.done {
                return Ok(0);
            }

            let mut client = self.client.borrow_mut();

            match client.chunk_read().map_err(std::io::Error::other)? {
                None => {
                    // A trailing status response reports errors that struck
                    // after the stream began
                    client.response().map_err(std::io::Error::other)?;
                    self.done = true;
                }
                Some(chunk) => {
                    self.chunk = chunk;
                    self.chunk_pos = 0;
                }
            }
        }
    }
}

/// Write stream pushing content chunks into the session.
struct RemoteWrite<R: Read, W: Write> {
    client: SharedClient<R, W>,
}

impl<R: Read, W: Write> Write for RemoteWrite<R, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.client
            .borrow_mut()
            .chunk_write(buf)
            .map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<R: Read, W: Write> StorageWrite for RemoteWrite<R, W> {
    fn close(self: Box<Self>) -> Result<()> {
        let mut client = self.client.borrow_mut();
        client.chunk_write_done()?;

        // Final ack confirms the peer closed its side of the file
        client.response()?;
        Ok(())
    }
}

impl<R: Read + 'static, W: Write + 'static> Storage for RemoteStorage<R, W> {
    fn new_read(&self, path: &str, param: ReadParam) -> Result<Option<Box<dyn Read>>> {
        let exists = {
            let mut pack = PackWrite::new();
            pack.write_str(path)?;
            pack.write_bool(param.ignore_missing)?;
            pack.write_u64(param.offset)?;
            pack.write_u64(param.limit.unwrap_or(0))?;
            pack.write_bool(param.limit.is_some())?;

            let response = self
                .client
                .borrow_mut()
                .request(CMD_STORAGE_OPEN_READ, Some(&pack.end()?))?;

            let mut read = PackRead::new(&response);
            read.read_bool()?
        };

        if !exists {
            return Ok(None);
        }

        Ok(Some(Box::new(RemoteRead {
            client: Rc::clone(&self.client),
            chunk: Vec::new(),
            chunk_pos: 0,
            done: false,
        })))
    }

    fn new_write(&self, path: &str, param: WriteParam) -> Result<Box<dyn StorageWrite>> {
        let mut pack = PackWrite::new();
        pack.write_str(path)?;
        pack.write_u32(param.mode.unwrap_or(0))?;
        pack.write_time(param.time.unwrap_or(0))?;
        pack.write_bool(param.atomic)?;
        pack.write_bool(param.create_path)?;

        self.client
            .borrow_mut()
            .request(CMD_STORAGE_OPEN_WRITE, Some(&pack.end()?))?;

        Ok(Box::new(RemoteWrite {
            client: Rc::clone(&self.client),
        }))
    }

    fn info(&self, path: &str, follow_link: bool) -> Result<StorageInfo> {
        let mut pack = PackWrite::new();
        pack.write_str(path)?;
        pack.write_bool(follow_link)?;

        let response = self
            .client
            .borrow_mut()
            .request(CMD_STORAGE_INFO, Some(&pack.end()?))?;

        info_unpack(&response)
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let mut pack = PackWrite::new();
        pack.write_str(path)?;

        let response = self
            .client
            .borrow_mut()
            .request(CMD_STORAGE_LIST, Some(&pack.end()?))?;

        let mut read = PackRead::new(&response);
        let mut names = Vec::new();

        read.array_begin()?;
        while read.next()? {
            names.push(read.read_str()?);
        }
        read.array_end()?;

        Ok(names)
    }

    fn link_create(&self, target: &str, link_path: &str) -> Result<()> {
        let mut pack = PackWrite::new();
        pack.write_str(target)?;
        pack.write_str(link_path)?;

        self.client
            .borrow_mut()
            .request(CMD_STORAGE_LINK_CREATE, Some(&pack.end()?))?;
        Ok(())
    }

    fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: u32,
    ) -> Result<()> {
        let mut pack = PackWrite::new();
        pack.write_str(path)?;
        pack.write_bool(error_on_exists)?;
        pack.write_bool(no_parent_create)?;
        pack.write_mode(mode)?;

        self.client
            .borrow_mut()
            .request(CMD_STORAGE_PATH_CREATE, Some(&pack.end()?))?;
        Ok(())
    }

    fn path_remove(&self, path: &str, recurse: bool) -> Result<bool> {
        let mut pack = PackWrite::new();
        pack.write_str(path)?;
        pack.write_bool(recurse)?;

        let response = self
            .client
            .borrow_mut()
            .request(CMD_STORAGE_PATH_REMOVE, Some(&pack.end()?))?;

        let mut read = PackRead::new(&response);
        Ok(read.read_bool()?)
    }

    fn path_sync(&self, path: &str) -> Result<()> {
        let mut pack = PackWrite::new();
        pack.write_str(path)?;

        self.client
            .borrow_mut()
            .request(CMD_STORAGE_PATH_SYNC, Some(&pack.end()?))?;
        Ok(())
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        let mut pack = PackWrite::new();
        pack.write_str(path)?;
        pack.write_bool(error_on_missing)?;

        self.client
            .borrow_mut()
            .request(CMD_STORAGE_REMOVE, Some(&pack.end()?))?;
        Ok(())
    }

    fn feature(&self, feature: StorageFeature) -> bool {
        let id = match feature {
            StorageFeature::Compress => 0u32,
            StorageFeature::AtomicWrite => 1,
        };

        let query = || -> Result<bool> {
            let mut pack = PackWrite::new();
            pack.write_u32(id)?;

            let response = self
                .client
                .borrow_mut()
                .request(CMD_STORAGE_FEATURE, Some(&pack.end()?))?;

            let mut read = PackRead::new(&response);
            Ok(read.read_bool()?)
        };

        query().unwrap_or(false)
    }
}
