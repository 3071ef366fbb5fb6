//! POSIX filesystem driver

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::trace;

use crate::error::{Result, StorageError};
use crate::{
    FileType, ReadParam, Storage, StorageFeature, StorageInfo, StorageWrite, WriteParam,
};

/// Local filesystem storage rooted at a base path.
///
/// All operation paths are joined below the root; absolute operation paths
/// are rejected to keep callers honest.
#[derive(Debug, Clone)]
pub struct PosixStorage {
    root: PathBuf,
}

impl PosixStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.starts_with('/') {
            return Err(StorageError::Assert(format!(
                "path '{path}' must be relative to the storage root"
            )));
        }

        Ok(self.root.join(path))
    }
}

fn info_from_metadata(metadata: &fs::Metadata, link_target: Option<String>) -> StorageInfo {
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let mode = 0o644;

    let file_type = if metadata.is_dir() {
        FileType::Path
    } else if metadata.is_symlink() {
        FileType::Link
    } else if metadata.is_file() {
        FileType::File
    } else {
        FileType::Special
    };

    let time = metadata
        .modified()
        .ok()
        .and_then(|time| match time.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(since) => i64::try_from(since.as_secs()).ok(),
            Err(before) => i64::try_from(before.duration().as_secs()).ok().map(|s| -s),
        })
        .unwrap_or(0);

    StorageInfo {
        exists: true,
        file_type,
        size: metadata.len(),
        time,
        mode,
        user: None,
        group: None,
        link_target,
    }
}

/// Open write stream, finished by rename when atomic.
struct PosixWrite {
    file: Option<File>,
    /// Path data is being written to (the temp path when atomic)
    write_path: PathBuf,
    /// Final path after close
    final_path: PathBuf,
    param: WriteParam,
}

impl Write for PosixWrite {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.file {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::other("write after close")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl StorageWrite for PosixWrite {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let map_err = |source| StorageError::FileWrite {
            path: self.final_path.display().to_string(),
            source,
        };

        match &mut self.file {
            Some(file) => {
                file.seek(SeekFrom::Start(offset)).map_err(map_err)?;
                file.write_all(data).map_err(map_err)
            }
            None => Err(StorageError::Assert(
                "positioned write after close".to_string(),
            )),
        }
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        match &self.file {
            Some(file) => file.set_len(size).map_err(|source| StorageError::FileWrite {
                path: self.final_path.display().to_string(),
                source,
            }),
            None => Err(StorageError::Assert(
                "truncate after close".to_string(),
            )),
        }
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let file = self.file.take().ok_or_else(|| {
            StorageError::Assert("storage write closed twice".to_string())
        })?;

        let map_err = |source| StorageError::FileWrite {
            path: self.final_path.display().to_string(),
            source,
        };

        if let Some(time) = self.param.time {
            let modified = if time >= 0 {
                SystemTime::UNIX_EPOCH + Duration::from_secs(time as u64)
            } else {
                SystemTime::UNIX_EPOCH - Duration::from_secs(time.unsigned_abs())
            };

            file.set_modified(modified).map_err(map_err)?;
        }

        file.sync_all().map_err(map_err)?;
        drop(file);

        if self.write_path != self.final_path {
            fs::rename(&self.write_path, &self.final_path).map_err(map_err)?;
        }

        Ok(())
    }
}

impl Storage for PosixStorage {
    fn new_read(&self, path: &str, param: ReadParam) -> Result<Option<Box<dyn Read>>> {
        let full_path = self.resolve(path)?;

        let mut file = match File::open(&full_path) {
            Ok(file) => file,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                if param.ignore_missing {
                    return Ok(None);
                }

                return Err(StorageError::FileOpen {
                    path: path.to_string(),
                    source,
                });
            }
            Err(source) => {
                return Err(StorageError::FileOpen {
                    path: path.to_string(),
                    source,
                });
            }
        };

        if param.offset > 0 {
            file.seek(SeekFrom::Start(param.offset))
                .map_err(|source| StorageError::FileRead {
                    path: path.to_string(),
                    source,
                })?;
        }

        trace!(path, offset = param.offset, limit = ?param.limit, "posix read open");

        Ok(Some(match param.limit {
            Some(limit) => Box::new(file.take(limit)),
            None => Box::new(file),
        }))
    }

    fn new_write(&self, path: &str, param: WriteParam) -> Result<Box<dyn StorageWrite>> {
        let final_path = self.resolve(path)?;

        if param.create_path {
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent).map_err(|source| StorageError::PathCreate {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }

        let write_path = if param.atomic {
            let mut name = final_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            name.push_str(".tmp");
            final_path.with_file_name(name)
        } else {
            final_path.clone()
        };

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(!param.no_truncate);

        #[cfg(unix)]
        if let Some(mode) = param.mode {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }

        let file = options
            .open(&write_path)
            .map_err(|source| StorageError::FileWrite {
                path: path.to_string(),
                source,
            })?;

        trace!(path, atomic = param.atomic, "posix write open");

        Ok(Box::new(PosixWrite {
            file: Some(file),
            write_path,
            final_path,
            param,
        }))
    }

    fn info(&self, path: &str, follow_link: bool) -> Result<StorageInfo> {
        let full_path = self.resolve(path)?;

        let metadata = if follow_link {
            fs::metadata(&full_path)
        } else {
            fs::symlink_metadata(&full_path)
        };

        match metadata {
            Ok(metadata) => {
                let link_target = if metadata.is_symlink() {
                    fs::read_link(&full_path)
                        .ok()
                        .map(|target| target.display().to_string())
                } else {
                    None
                };

                Ok(info_from_metadata(&metadata, link_target))
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok(StorageInfo::default())
            }
            Err(source) => Err(StorageError::FileInfo {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let full_path = self.resolve(path)?;
        let mut names = Vec::new();

        let entries = fs::read_dir(&full_path).map_err(|source| StorageError::FileInfo {
            path: path.to_string(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| StorageError::FileInfo {
                path: path.to_string(),
                source,
            })?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }

        Ok(names)
    }

    fn link_create(&self, target: &str, link_path: &str) -> Result<()> {
        let full_link = self.resolve(link_path)?;

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, &full_link).map_err(|source| {
                StorageError::LinkCreate {
                    path: link_path.to_string(),
                    source,
                }
            })
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            Err(StorageError::Assert(
                "links are not supported on this platform".to_string(),
            ))
        }
    }

    fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: u32,
    ) -> Result<()> {
        let full_path = self.resolve(path)?;

        let result = if no_parent_create {
            fs::create_dir(&full_path)
        } else {
            fs::create_dir_all(&full_path)
        };

        match result {
            Ok(()) => {
                #[cfg(unix)]
                if mode != 0 {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&full_path, fs::Permissions::from_mode(mode)).map_err(
                        |source| StorageError::PathCreate {
                            path: path.to_string(),
                            source,
                        },
                    )?;
                }
                #[cfg(not(unix))]
                let _ = mode;

                Ok(())
            }
            Err(source) if source.kind() == std::io::ErrorKind::AlreadyExists => {
                if error_on_exists {
                    Err(StorageError::PathCreate {
                        path: path.to_string(),
                        source,
                    })
                } else {
                    Ok(())
                }
            }
            Err(source) => Err(StorageError::PathCreate {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn path_remove(&self, path: &str, recurse: bool) -> Result<bool> {
        let full_path = self.resolve(path)?;

        let result = if recurse {
            fs::remove_dir_all(&full_path)
        } else {
            fs::remove_dir(&full_path)
        };

        match result {
            Ok(()) => Ok(true),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::PathRemove {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn path_sync(&self, path: &str) -> Result<()> {
        let full_path = self.resolve(path)?;

        let dir = File::open(&full_path).map_err(|source| StorageError::PathSync {
            path: path.to_string(),
            source,
        })?;

        dir.sync_all().map_err(|source| StorageError::PathSync {
            path: path.to_string(),
            source,
        })
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        let full_path = self.resolve(path)?;

        match fs::remove_file(&full_path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                if error_on_missing {
                    Err(StorageError::FileRemove {
                        path: path.to_string(),
                        source,
                    })
                } else {
                    Ok(())
                }
            }
            Err(source) => Err(StorageError::FileRemove {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn time_set(&self, path: &str, time: i64) -> Result<()> {
        let full_path = self.resolve(path)?;

        let modified = if time >= 0 {
            SystemTime::UNIX_EPOCH + Duration::from_secs(time as u64)
        } else {
            SystemTime::UNIX_EPOCH - Duration::from_secs(time.unsigned_abs())
        };

        let file = File::options()
            .write(true)
            .open(&full_path)
            .map_err(|source| StorageError::FileInfo {
                path: path.to_string(),
                source,
            })?;

        file.set_modified(modified)
            .map_err(|source| StorageError::FileInfo {
                path: path.to_string(),
                source,
            })
    }

    fn feature(&self, feature: StorageFeature) -> bool {
        matches!(feature, StorageFeature::AtomicWrite)
    }
}

/// Root accessor for callers that need to display full paths.
impl AsRef<Path> for PosixStorage {
    fn as_ref(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, PosixStorage) {
        let dir = TempDir::new().unwrap();
        let storage = PosixStorage::new(dir.path());
        (dir, storage)
    }

    fn write_file(storage: &PosixStorage, path: &str, data: &[u8], param: WriteParam) {
        let mut write = storage.new_write(path, param).unwrap();
        write.write_all(data).unwrap();
        write.close().unwrap();
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, storage) = storage();

        write_file(
            &storage,
            "sub/file.bin",
            b"posix bytes",
            WriteParam::new().create_path(),
        );

        let mut read = storage
            .new_read("sub/file.bin", ReadParam::new())
            .unwrap()
            .unwrap();
        let mut data = Vec::new();
        read.read_to_end(&mut data).unwrap();

        assert_eq!(data, b"posix bytes");
    }

    #[test]
    fn read_with_offset_and_limit() {
        let (_dir, storage) = storage();
        write_file(&storage, "f", b"0123456789", WriteParam::new());

        let mut read = storage
            .new_read("f", ReadParam::new().offset(3).limit(4))
            .unwrap()
            .unwrap();
        let mut data = Vec::new();
        read.read_to_end(&mut data).unwrap();

        assert_eq!(data, b"3456");
    }

    #[test]
    fn missing_file_with_ignore_returns_none() {
        let (_dir, storage) = storage();

        assert!(storage
            .new_read("absent", ReadParam::new().ignore_missing())
            .unwrap()
            .is_none());

        assert!(matches!(
            storage.new_read("absent", ReadParam::new()),
            Err(StorageError::FileOpen { .. })
        ));
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let (_dir, storage) = storage();

        write_file(&storage, "target", b"data", WriteParam::new().atomic());

        let names = storage.list("").unwrap();
        assert_eq!(names, vec!["target".to_string()]);
    }

    #[test]
    fn info_reports_size_and_missing() {
        let (_dir, storage) = storage();
        write_file(&storage, "f", b"12345", WriteParam::new());

        let info = storage.info("f", true).unwrap();
        assert!(info.exists);
        assert_eq!(info.size, 5);
        assert_eq!(info.file_type, FileType::File);

        assert!(!storage.info("absent", true).unwrap().exists);
    }

    #[test]
    fn write_sets_modification_time() {
        let (_dir, storage) = storage();

        write_file(
            &storage,
            "stamped",
            b"x",
            WriteParam::new().time(1_600_000_000),
        );

        let info = storage.info("stamped", true).unwrap();
        assert_eq!(info.time, 1_600_000_000);
    }

    #[test]
    fn remove_honors_error_on_missing() {
        let (_dir, storage) = storage();
        write_file(&storage, "f", b"x", WriteParam::new());

        storage.remove("f", true).unwrap();
        storage.remove("f", false).unwrap();
        assert!(matches!(
            storage.remove("f", true),
            Err(StorageError::FileRemove { .. })
        ));
    }

    #[test]
    fn path_create_and_remove() {
        let (_dir, storage) = storage();

        storage.path_create("a/b/c", false, false, 0o750).unwrap();
        assert!(storage.info("a/b/c", true).unwrap().exists);

        // Exists without error flag is fine, with it is not
        storage.path_create("a/b/c", false, false, 0o750).unwrap();
        assert!(storage.path_create("a/b/c", true, false, 0o750).is_err());

        assert!(storage.path_remove("a", true).unwrap());
        assert!(!storage.path_remove("a", true).unwrap());
    }
}
