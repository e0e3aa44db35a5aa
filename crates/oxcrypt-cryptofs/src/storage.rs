//! Ciphertext storage backend.
//!
//! Everything that touches the host filesystem goes through [`StorageBackend`].
//! The crate ships [`LocalStorage`]; tests wrap it to inject failures.
//! Backends never retry: every I/O failure is surfaced as a [`StorageError`]
//! carrying the path and the attempted operation.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{trace, warn};

use crate::error::ErrorKind;

#[derive(Error, Debug)]
#[error("Failed to {op} '{}': {source}", path.display())]
pub struct StorageError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl StorageError {
    pub fn new(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.source.kind() == io::ErrorKind::AlreadyExists
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

/// Minimal attributes needed by the mapping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub is_dir: bool,
    pub len: u64,
}

/// Capacity figures of the volume holding the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStore {
    pub total_space: u64,
    pub free_space: u64,
    pub available_space: u64,
    pub allocation_granularity: u64,
}

/// Operations the vault needs from the storage holding its ciphertext.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError>;

    /// Replace the file at `path` atomically: readers see either the old or the
    /// new content, never a mix.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError>;

    /// Create a new file, failing if it already exists.
    fn create_new(&self, path: &Path, data: &[u8]) -> Result<(), StorageError>;

    /// Read up to `buf.len()` bytes at `offset`. Returns fewer only at end of file.
    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write `data` at `offset`. The file must already exist.
    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    fn set_len(&self, path: &Path, len: u64) -> Result<(), StorageError>;

    /// `None` if nothing exists at `path`.
    fn attributes(&self, path: &Path) -> Result<Option<Attributes>, StorageError>;

    /// Names of the entries of a directory.
    fn list(&self, dir: &Path) -> Result<Vec<String>, StorageError>;

    /// Create a directory, failing if it already exists.
    fn create_dir(&self, path: &Path) -> Result<(), StorageError>;

    fn create_dir_all(&self, path: &Path) -> Result<(), StorageError>;

    fn remove_file(&self, path: &Path) -> Result<(), StorageError>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> Result<(), StorageError>;

    fn remove_dir_all(&self, path: &Path) -> Result<(), StorageError>;

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError>;

    fn file_store(&self, path: &Path) -> Result<FileStore, StorageError>;
}

/// [`StorageBackend`] on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        LocalStorage
    }
}

impl StorageBackend for LocalStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        fs::read(path).map_err(|e| StorageError::new("read", path, e))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let parent = path.parent().ok_or_else(|| {
            StorageError::new(
                "write",
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "no parent directory"),
            )
        })?;

        // Temp file in the same directory so the final rename stays on one filesystem
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| StorageError::new("create temp file in", parent, e))?;
        temp.write_all(data)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| StorageError::new("write", temp.path().to_path_buf(), e))?;
        temp.persist(path)
            .map_err(|e| StorageError::new("persist", path, e.error))?;
        trace!(path = %path.display(), len = data.len(), "Atomic write complete");
        Ok(())
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StorageError::new("create", path, e))?;
        file.write_all(data)
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::new("write", path, e))
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let mut file = File::open(path).map_err(|e| StorageError::new("open", path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::new("seek", path, e))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(StorageError::new("read", path, e)),
            }
        }
        Ok(filled)
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StorageError::new("open", path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::new("seek", path, e))?;
        file.write_all(data)
            .map_err(|e| StorageError::new("write", path, e))
    }

    fn set_len(&self, path: &Path, len: u64) -> Result<(), StorageError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StorageError::new("open", path, e))?;
        file.set_len(len)
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::new("truncate", path, e))
    }

    fn attributes(&self, path: &Path) -> Result<Option<Attributes>, StorageError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Attributes {
                is_dir: meta.is_dir(),
                len: meta.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::new("stat", path, e)),
        }
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(dir).map_err(|e| StorageError::new("list", dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::new("list", dir, e))?;
            // Non UTF-8 names cannot be vault entries
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        fs::create_dir(path).map_err(|e| StorageError::new("create directory", path, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(path).map_err(|e| StorageError::new("create directory", path, e))
    }

    fn remove_file(&self, path: &Path) -> Result<(), StorageError> {
        fs::remove_file(path).map_err(|e| StorageError::new("remove", path, e))
    }

    fn remove_dir(&self, path: &Path) -> Result<(), StorageError> {
        fs::remove_dir(path).map_err(|e| StorageError::new("remove directory", path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), StorageError> {
        fs::remove_dir_all(path).map_err(|e| StorageError::new("remove directory", path, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        fs::rename(from, to).map_err(|e| StorageError::new("rename", from, e))
    }

    fn file_store(&self, path: &Path) -> Result<FileStore, StorageError> {
        fn space(
            op: &'static str,
            path: &Path,
            query: impl FnOnce(&Path) -> io::Result<u64>,
        ) -> Result<u64, StorageError> {
            query(path).map_err(|e| StorageError::new(op, path, e))
        }

        Ok(FileStore {
            total_space: space("query total space of", path, |p| fs2::total_space(p))?,
            free_space: space("query free space of", path, |p| fs2::free_space(p))?,
            available_space: space("query available space of", path, |p| {
                fs2::available_space(p)
            })?,
            allocation_granularity: space("query allocation granularity of", path, |p| {
                fs2::allocation_granularity(p)
            })?,
        })
    }
}

/// Look up the native file store of `path`, degrading to `None` on failure.
pub fn native_file_store(storage: &dyn StorageBackend, path: &Path) -> Option<FileStore> {
    match storage.file_store(path) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to get file store");
            None
        }
    }
}
