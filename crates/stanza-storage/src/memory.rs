//! In-memory driver
//!
//! Keyed blobs behind the [`Storage`] trait. Used by unit tests as a
//! repository stand-in and as the backend of a protocol server in
//! loopback setups. Writes are buffered and land atomically on close,
//! which mirrors the semantics callers rely on from real repositories.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use crate::error::{Result, StorageError};
use crate::{
    FileType, ReadParam, Storage, StorageFeature, StorageInfo, StorageWrite, WriteParam,
};

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    mode: u32,
    time: i64,
}

#[derive(Debug, Default)]
struct Inner {
    files: BTreeMap<String, MemoryFile>,
    paths: BTreeMap<String, u32>,
    links: BTreeMap<String, String>,
}

/// Shared in-memory storage; clones refer to the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning cannot leave the map in a broken state; recover
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Raw contents of a file, for test assertions.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).map(|file| file.data.clone())
    }
}

struct MemoryWrite {
    storage: MemoryStorage,
    path: String,
    data: Vec<u8>,
    param: WriteParam,
}

impl Write for MemoryWrite {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageWrite for MemoryWrite {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();

        if self.data.len() < end {
            self.data.resize(end, 0);
        }

        self.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.data.resize(size as usize, 0);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut inner = self.storage.lock();

        inner.files.insert(
            self.path.clone(),
            MemoryFile {
                data: self.data,
                mode: self.param.mode.unwrap_or(0o640),
                time: self.param.time.unwrap_or(0),
            },
        );

        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn new_read(&self, path: &str, param: ReadParam) -> Result<Option<Box<dyn Read>>> {
        let inner = self.lock();

        let Some(file) = inner.files.get(path) else {
            if param.ignore_missing {
                return Ok(None);
            }

            return Err(StorageError::FileOpen {
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        };

        let start = (param.offset as usize).min(file.data.len());
        let end = match param.limit {
            Some(limit) => (start + limit as usize).min(file.data.len()),
            None => file.data.len(),
        };

        Ok(Some(Box::new(Cursor::new(file.data[start..end].to_vec()))))
    }

    fn new_write(&self, path: &str, param: WriteParam) -> Result<Box<dyn StorageWrite>> {
        // Positioned writes patch existing content, so carry it over
        let data = if param.no_truncate {
            self.lock()
                .files
                .get(path)
                .map(|file| file.data.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(Box::new(MemoryWrite {
            storage: self.clone(),
            path: path.to_string(),
            data,
            param,
        }))
    }

    fn info(&self, path: &str, _follow_link: bool) -> Result<StorageInfo> {
        let inner = self.lock();

        if let Some(file) = inner.files.get(path) {
            return Ok(StorageInfo {
                exists: true,
                file_type: FileType::File,
                size: file.data.len() as u64,
                time: file.time,
                mode: file.mode,
                user: None,
                group: None,
                link_target: None,
            });
        }

        if inner.paths.contains_key(path)
            || inner
                .files
                .keys()
                .any(|key| key.starts_with(path) && key[path.len()..].starts_with('/'))
        {
            return Ok(StorageInfo {
                exists: true,
                file_type: FileType::Path,
                ..StorageInfo::default()
            });
        }

        if let Some(target) = inner.links.get(path) {
            return Ok(StorageInfo {
                exists: true,
                file_type: FileType::Link,
                link_target: Some(target.clone()),
                ..StorageInfo::default()
            });
        }

        Ok(StorageInfo::default())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };

        let mut names: Vec<String> = inner
            .files
            .keys()
            .chain(inner.paths.keys())
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                Some(rest.split('/').next().unwrap_or(rest).to_string())
            })
            .collect();

        names.sort_unstable();
        names.dedup();
        Ok(names)
    }

    fn link_create(&self, target: &str, link_path: &str) -> Result<()> {
        self.lock()
            .links
            .insert(link_path.to_string(), target.to_string());
        Ok(())
    }

    fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        _no_parent_create: bool,
        mode: u32,
    ) -> Result<()> {
        let mut inner = self.lock();

        if inner.paths.contains_key(path) {
            if error_on_exists {
                return Err(StorageError::PathCreate {
                    path: path.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::AlreadyExists),
                });
            }

            return Ok(());
        }

        inner.paths.insert(path.to_string(), mode);
        Ok(())
    }

    fn path_remove(&self, path: &str, recurse: bool) -> Result<bool> {
        let mut inner = self.lock();
        let existed = inner.paths.remove(path).is_some();

        if recurse {
            let prefix = format!("{path}/");
            let removed_files = inner.files.len();
            inner.files.retain(|key, _| !key.starts_with(&prefix));
            inner.paths.retain(|key, _| !key.starts_with(&prefix));

            return Ok(existed || removed_files != inner.files.len());
        }

        Ok(existed)
    }

    fn path_sync(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        let mut inner = self.lock();

        if inner.files.remove(path).is_none() && error_on_missing {
            return Err(StorageError::FileRemove {
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        Ok(())
    }

    fn time_set(&self, path: &str, time: i64) -> Result<()> {
        let mut inner = self.lock();

        match inner.files.get_mut(path) {
            Some(file) => {
                file.time = time;
                Ok(())
            }
            None => Err(StorageError::FileInfo {
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }

    fn feature(&self, feature: StorageFeature) -> bool {
        matches!(feature, StorageFeature::AtomicWrite)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let storage = MemoryStorage::new();

        let mut write = storage.new_write("a/b", WriteParam::new()).unwrap();
        write.write_all(b"memory bytes").unwrap();
        write.close().unwrap();

        let mut read = storage.new_read("a/b", ReadParam::new()).unwrap().unwrap();
        let mut data = Vec::new();
        read.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"memory bytes");
    }

    #[test]
    fn data_lands_only_on_close() {
        let storage = MemoryStorage::new();

        let mut write = storage.new_write("f", WriteParam::new()).unwrap();
        write.write_all(b"pending").unwrap();
        assert!(!storage.info("f", true).unwrap().exists);

        write.close().unwrap();
        assert!(storage.info("f", true).unwrap().exists);
    }

    #[test]
    fn offset_and_limit_reads() {
        let storage = MemoryStorage::new();
        let mut write = storage.new_write("f", WriteParam::new()).unwrap();
        write.write_all(b"0123456789").unwrap();
        write.close().unwrap();

        let mut read = storage
            .new_read("f", ReadParam::new().offset(2).limit(3))
            .unwrap()
            .unwrap();
        let mut data = Vec::new();
        read.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"234");
    }

    #[test]
    fn list_returns_direct_children() {
        let storage = MemoryStorage::new();

        for path in ["dir/a", "dir/b", "dir/sub/c", "other/d"] {
            let write = storage.new_write(path, WriteParam::new()).unwrap();
            write.close().unwrap();
        }

        let mut names = storage.list("dir").unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b", "sub"]);
    }

    #[test]
    fn clones_share_contents() {
        let storage = MemoryStorage::new();
        let other = storage.clone();

        let write = storage.new_write("shared", WriteParam::new()).unwrap();
        write.close().unwrap();

        assert!(other.info("shared", true).unwrap().exists);
    }
}
