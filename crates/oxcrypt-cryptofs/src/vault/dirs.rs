//! Cleartext directory to ciphertext storage mapping.
//!
//! Each cleartext directory owns a random [`DirectoryId`]. Its contents live in
//! `d/<2 chars>/<30 chars>` under the vault root, derived from a hash of the
//! id alone, so the storage location never depends on the cleartext path.
//! The parent directory only holds a small entry for the child:
//!
//! ```text
//! <parent storage dir>/
//!     <encrypted name>.c9r/      # directory entry
//!         dir.c9r                # marker: the child's directory id
//!     <encrypted name>.c9r       # file entry: header + chunks
//! d/AB/CDEFGHIJKLMNOPQRSTUVWXYZ234567/
//!     dirid.c9r                  # the directory's own id, content-encrypted
//! ```
//!
//! Renaming or moving an entry therefore only renames that entry; everything
//! below a moved directory keeps its ids and bytes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use moka::sync::Cache;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::crypto::{CryptoError, Cryptor};
use crate::error::ErrorKind;
use crate::readonly::{ReadOnlyViolation, ReadonlyFlag};
use crate::storage::{StorageBackend, StorageError};
use crate::vault::locks::DirectoryLocks;
use crate::vault::path::{DirectoryId, VaultPath};

/// Name of the directory holding all ciphertext storage directories.
pub const DATA_DIR_NAME: &str = "d";
/// Extension of encrypted entry names.
pub const ENCRYPTED_EXTENSION: &str = ".c9r";
/// Marker inside a directory entry naming the child's id.
pub const DIR_MARKER_FILE: &str = "dir.c9r";
/// Encrypted copy of a storage directory's own id.
pub const DIR_ID_BACKUP_FILE: &str = "dirid.c9r";

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("No such file or directory: '{path}'")]
    NotFound { path: String },

    #[error("Already exists: '{path}'")]
    AlreadyExists { path: String },

    #[error("Not a directory: '{path}'")]
    NotADirectory { path: String },

    #[error("Not a file: '{path}'")]
    NotAFile { path: String },

    #[error("Directory not empty: '{path}'")]
    NotEmpty { path: String },

    #[error("Invalid path '{path}': {reason}")]
    InvalidInput { path: String, reason: &'static str },

    #[error("[INTEGRITY VIOLATION] Directory marker missing at '{}'", marker.display())]
    MissingMarker { marker: PathBuf },

    #[error("[INTEGRITY VIOLATION] Directory marker at '{}' is malformed", marker.display())]
    MalformedMarker { marker: PathBuf },

    #[error("[INTEGRITY VIOLATION] Storage directory '{}' for '{path}' is missing", storage.display())]
    MissingStorage { path: String, storage: PathBuf },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    ReadOnly(#[from] ReadOnlyViolation),
}

impl DirectoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DirectoryError::NotFound { .. } => ErrorKind::NotFound,
            DirectoryError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            DirectoryError::NotADirectory { .. }
            | DirectoryError::NotAFile { .. }
            | DirectoryError::NotEmpty { .. }
            | DirectoryError::InvalidInput { .. } => ErrorKind::InvalidInput,
            DirectoryError::MissingMarker { .. }
            | DirectoryError::MalformedMarker { .. }
            | DirectoryError::MissingStorage { .. } => ErrorKind::Integrity,
            DirectoryError::Storage(e) => e.kind(),
            DirectoryError::Crypto(e) => e.kind(),
            DirectoryError::ReadOnly(e) => e.kind(),
        }
    }
}

/// A resolved directory: its id and where its contents are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextDirectory {
    pub dir_id: DirectoryId,
    pub storage_path: PathBuf,
}

/// What a cleartext entry is, as seen in its parent's storage directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Maps cleartext paths to ciphertext locations and maintains directory entries.
pub struct DirectoryIdMapper {
    vault_root: PathBuf,
    storage: Arc<dyn StorageBackend>,
    cryptor: Arc<Cryptor>,
    readonly: Arc<ReadonlyFlag>,
    locks: DirectoryLocks,
    cache: Cache<VaultPath, CiphertextDirectory>,
    /// Bumped on every invalidation. Resolutions that started under an older
    /// generation do not populate the cache.
    generation: RwLock<u64>,
    chunk_size: usize,
}

impl std::fmt::Debug for DirectoryIdMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryIdMapper")
            .field("vault_root", &self.vault_root)
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

fn display(path: &VaultPath) -> String {
    path.to_string()
}

impl DirectoryIdMapper {
    pub fn new(
        vault_root: impl Into<PathBuf>,
        storage: Arc<dyn StorageBackend>,
        cryptor: Arc<Cryptor>,
        readonly: Arc<ReadonlyFlag>,
        cache_capacity: u64,
        chunk_size: usize,
    ) -> Self {
        Self {
            vault_root: vault_root.into(),
            storage,
            cryptor,
            readonly,
            locks: DirectoryLocks::new(),
            cache: Cache::builder().max_capacity(cache_capacity).build(),
            generation: RwLock::new(0),
            chunk_size,
        }
    }

    /// Storage location of a directory id: `<vault>/d/<2>/<30>`.
    pub fn storage_path_for(&self, dir_id: &DirectoryId) -> Result<PathBuf, DirectoryError> {
        let hash = self.cryptor.hash_directory_id(dir_id.as_str())?;
        let (bucket, rest) = hash.split_at(2);
        Ok(self.vault_root.join(DATA_DIR_NAME).join(bucket).join(rest))
    }

    pub fn root(&self) -> Result<CiphertextDirectory, DirectoryError> {
        let dir_id = DirectoryId::root();
        let storage_path = self.storage_path_for(&dir_id)?;
        Ok(CiphertextDirectory { dir_id, storage_path })
    }

    fn check_path(path: &VaultPath) -> Result<(), DirectoryError> {
        if path.escapes_root() {
            return Err(DirectoryError::InvalidInput {
                path: display(path),
                reason: "path escapes the vault root",
            });
        }
        Ok(())
    }

    /// Resolve a cleartext directory to its ciphertext location.
    ///
    /// Every ancestor's marker is read (or taken from the cache). A missing or
    /// malformed marker is an integrity error, never "not found".
    #[instrument(level = "debug", skip(self, path), fields(path = %path))]
    pub fn resolve(&self, path: &VaultPath) -> Result<CiphertextDirectory, DirectoryError> {
        Self::check_path(path)?;
        if path.is_root() {
            return self.root();
        }
        if let Some(hit) = self.cache.get(path) {
            trace!("Resolution cache hit");
            return Ok(hit);
        }

        let generation = *self.generation.read().unwrap_or_else(PoisonError::into_inner);

        let mut current = self.root()?;
        let mut walked = VaultPath::root();
        for name in path.components() {
            walked = walked.join(name);
            current = match self.cache.get(&walked) {
                Some(hit) => hit,
                None => self.resolve_child(&current, name, &walked)?,
            };
        }

        let guard = self.generation.read().unwrap_or_else(PoisonError::into_inner);
        if *guard == generation {
            self.cache.insert(path.clone(), current.clone());
        } else {
            trace!("Directory tree changed during resolution, not caching");
        }
        drop(guard);

        Ok(current)
    }

    fn resolve_child(
        &self,
        parent: &CiphertextDirectory,
        name: &str,
        path: &VaultPath,
    ) -> Result<CiphertextDirectory, DirectoryError> {
        let entry = self.entry_in(parent, name)?;

        // Read the marker before looking at the entry: a concurrent move may
        // rename the entry at any point, and that must read as "not found"
        let marker = entry.join(DIR_MARKER_FILE);
        let bytes = match self.storage.read(&marker) {
            Ok(bytes) => bytes,
            Err(e) => {
                return match self.storage.attributes(&entry)? {
                    None => Err(DirectoryError::NotFound { path: display(path) }),
                    Some(attrs) if !attrs.is_dir => {
                        Err(DirectoryError::NotADirectory { path: display(path) })
                    }
                    Some(_) if e.is_not_found() => {
                        warn!(marker = %marker.display(), "Directory entry without marker");
                        Err(DirectoryError::MissingMarker { marker })
                    }
                    Some(_) => Err(e.into()),
                };
            }
        };
        let dir_id = DirectoryId::parse_marker(&bytes).ok_or_else(|| {
            warn!(marker = %marker.display(), len = bytes.len(), "Malformed directory marker");
            DirectoryError::MalformedMarker {
                marker: marker.clone(),
            }
        })?;

        let storage_path = self.storage_path_for(&dir_id)?;
        if self.storage.attributes(&storage_path)?.is_none() {
            // Deletion hides the entry before removing storage
            if self.storage.attributes(&entry)?.is_none() {
                return Err(DirectoryError::NotFound { path: display(path) });
            }
            warn!(storage = %storage_path.display(), "Storage directory missing");
            return Err(DirectoryError::MissingStorage {
                path: display(path),
                storage: storage_path,
            });
        }

        trace!(dir_id = %dir_id, "Resolved directory");
        Ok(CiphertextDirectory { dir_id, storage_path })
    }

    /// Path of the entry for `name` inside `parent`'s storage directory.
    fn entry_in(&self, parent: &CiphertextDirectory, name: &str) -> Result<PathBuf, DirectoryError> {
        let encrypted = self.cryptor.encrypt_filename(name, parent.dir_id.as_str())?;
        Ok(parent
            .storage_path
            .join(format!("{encrypted}{ENCRYPTED_EXTENSION}")))
    }

    /// Resolve the parent of `path` and the ciphertext entry `path` would occupy.
    fn locate_entry(&self, path: &VaultPath) -> Result<(CiphertextDirectory, PathBuf), DirectoryError> {
        Self::check_path(path)?;
        let (parent_path, name) = path.split().ok_or_else(|| DirectoryError::InvalidInput {
            path: display(path),
            reason: "the vault root has no entry",
        })?;
        let parent = self.resolve(&parent_path)?;
        let entry = self.entry_in(&parent, name)?;
        Ok((parent, entry))
    }

    /// Ciphertext location of the file at `path`. The file need not exist yet,
    /// but its parent directory must.
    pub fn ciphertext_file_path(&self, path: &VaultPath) -> Result<PathBuf, DirectoryError> {
        self.locate_entry(path).map(|(_, entry)| entry)
    }

    /// Whether `path` exists and what it is.
    pub fn entry_kind(&self, path: &VaultPath) -> Result<Option<EntryKind>, DirectoryError> {
        if path.is_root() {
            return Ok(Some(EntryKind::Directory));
        }
        let (_, entry) = self.locate_entry(path)?;
        Ok(self.storage.attributes(&entry)?.map(|attrs| {
            if attrs.is_dir {
                EntryKind::Directory
            } else {
                EntryKind::File
            }
        }))
    }

    /// Create the cleartext directory `path` with a fresh id.
    ///
    /// The storage directory and its `dirid.c9r` are written first. The entry
    /// in the parent is assembled under a hidden temporary name and renamed
    /// into place last, so after a crash the directory is either absent or
    /// complete with its marker.
    #[instrument(level = "debug", skip(self, path), fields(path = %path))]
    pub fn create_directory(&self, path: &VaultPath) -> Result<DirectoryId, DirectoryError> {
        self.readonly.check("create directory")?;
        if path.is_root() {
            return Err(DirectoryError::AlreadyExists { path: display(path) });
        }
        let (parent, entry) = self.locate_entry(path)?;

        self.locks.with_locked(&[parent.storage_path.as_path()], || {
            if self.storage.attributes(&entry)?.is_some() {
                return Err(DirectoryError::AlreadyExists { path: display(path) });
            }

            let dir_id = DirectoryId::from_raw(self.cryptor.random_directory_id()?);
            let storage_path = self.storage_path_for(&dir_id)?;
            let temp_entry = parent.storage_path.join(format!(".{dir_id}{ENCRYPTED_EXTENSION}.tmp"));

            let result = self
                .write_storage_directory(&dir_id, &storage_path)
                .and_then(|()| self.write_entry(&dir_id, &temp_entry, &entry));
            if let Err(e) = result {
                warn!(error = %e, "Directory creation failed, cleaning up");
                self.remove_quietly(&temp_entry);
                self.remove_quietly(&storage_path);
                return Err(e);
            }

            debug!(dir_id = %dir_id, "Directory created");
            Ok(dir_id)
        })
    }

    fn write_storage_directory(
        &self,
        dir_id: &DirectoryId,
        storage_path: &Path,
    ) -> Result<(), DirectoryError> {
        self.storage.create_dir_all(storage_path)?;
        let backup = self.cryptor.encrypt_content(dir_id.as_bytes(), self.chunk_size)?;
        self.storage
            .create_new(&storage_path.join(DIR_ID_BACKUP_FILE), &backup)?;
        Ok(())
    }

    fn write_entry(
        &self,
        dir_id: &DirectoryId,
        temp_entry: &Path,
        entry: &Path,
    ) -> Result<(), DirectoryError> {
        self.storage.create_dir(temp_entry)?;
        self.storage
            .create_new(&temp_entry.join(DIR_MARKER_FILE), dir_id.as_bytes())?;
        self.storage.rename(temp_entry, entry)?;
        Ok(())
    }

    fn remove_file_if_present(&self, path: &Path) -> Result<(), StorageError> {
        match self.storage.remove_file(path) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn remove_quietly(&self, path: &Path) {
        match self.storage.remove_dir_all(path) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Cleanup failed"),
        }
    }

    /// Create an empty file entry at `path` holding `initial` ciphertext.
    pub(crate) fn create_file_entry(
        &self,
        path: &VaultPath,
        initial: &[u8],
    ) -> Result<PathBuf, DirectoryError> {
        self.readonly.check("create file")?;
        let (parent, entry) = self.locate_entry(path)?;
        self.locks.with_locked(&[parent.storage_path.as_path()], || {
            match self.storage.create_new(&entry, initial) {
                Ok(()) => {
                    debug!(path = %path, "File entry created");
                    Ok(entry.clone())
                }
                Err(e) if e.is_already_exists() => {
                    Err(DirectoryError::AlreadyExists { path: display(path) })
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Move or rename a file or directory.
    ///
    /// Only the entry itself is renamed (and its name re-encrypted under the
    /// destination parent). Descendants of a moved directory are untouched.
    pub fn move_entry(&self, src: &VaultPath, dst: &VaultPath) -> Result<(), DirectoryError> {
        self.move_entry_with(src, dst, |_, _| {})
    }

    /// [`move_entry`](Self::move_entry), calling `on_move(from, to)` with the
    /// ciphertext entry paths while both parents are locked, just before the
    /// rename. If the rename fails, `on_move(to, from)` is called to undo it.
    #[instrument(level = "debug", skip(self, src, dst, on_move), fields(src = %src, dst = %dst))]
    pub(crate) fn move_entry_with(
        &self,
        src: &VaultPath,
        dst: &VaultPath,
        on_move: impl Fn(&Path, &Path),
    ) -> Result<(), DirectoryError> {
        self.readonly.check("move")?;
        if src.is_root() || dst.is_root() {
            return Err(DirectoryError::InvalidInput {
                path: display(src),
                reason: "the vault root cannot be moved or replaced",
            });
        }
        if src == dst {
            return match self.entry_kind(src)? {
                Some(_) => Ok(()),
                None => Err(DirectoryError::NotFound { path: display(src) }),
            };
        }
        if dst.starts_with(src) {
            return Err(DirectoryError::InvalidInput {
                path: display(dst),
                reason: "a directory cannot be moved into itself",
            });
        }

        let (src_parent, src_entry) = self.locate_entry(src)?;
        let (dst_parent, dst_entry) = self.locate_entry(dst)?;

        let moved_kind = self.locks.with_locked(
            &[src_parent.storage_path.as_path(), dst_parent.storage_path.as_path()],
            || {
                let attrs = self
                    .storage
                    .attributes(&src_entry)?
                    .ok_or_else(|| DirectoryError::NotFound { path: display(src) })?;
                if self.storage.attributes(&dst_entry)?.is_some() {
                    return Err(DirectoryError::AlreadyExists { path: display(dst) });
                }
                on_move(&src_entry, &dst_entry);
                if let Err(e) = self.storage.rename(&src_entry, &dst_entry) {
                    on_move(&dst_entry, &src_entry);
                    return Err(e.into());
                }
                Ok(if attrs.is_dir {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                })
            },
        )?;

        if moved_kind == EntryKind::Directory {
            self.invalidate();
        }
        debug!(kind = ?moved_kind, "Entry moved");
        Ok(())
    }

    /// Delete an empty directory.
    #[instrument(level = "debug", skip(self, path), fields(path = %path))]
    pub fn delete_directory(&self, path: &VaultPath) -> Result<(), DirectoryError> {
        self.readonly.check("delete directory")?;
        if path.is_root() {
            return Err(DirectoryError::InvalidInput {
                path: display(path),
                reason: "the vault root cannot be deleted",
            });
        }
        let target = self.resolve(path)?;
        let (parent, entry) = self.locate_entry(path)?;

        self.locks.with_locked(
            &[parent.storage_path.as_path(), target.storage_path.as_path()],
            || {
                let has_children = self
                    .storage
                    .list(&target.storage_path)?
                    .iter()
                    .any(|name| name != DIR_ID_BACKUP_FILE);
                if has_children {
                    return Err(DirectoryError::NotEmpty { path: display(path) });
                }

                // Hide the entry first: once it is gone the directory is gone
                let doomed = parent
                    .storage_path
                    .join(format!(".{}{ENCRYPTED_EXTENSION}.del", target.dir_id));
                self.storage.rename(&entry, &doomed)?;
                self.remove_file_if_present(&doomed.join(DIR_MARKER_FILE))?;
                self.storage.remove_dir(&doomed)?;
                self.remove_file_if_present(&target.storage_path.join(DIR_ID_BACKUP_FILE))?;
                self.storage.remove_dir(&target.storage_path)?;
                Ok(())
            },
        )?;

        self.invalidate();
        debug!(dir_id = %target.dir_id, "Directory deleted");
        Ok(())
    }

    /// Delete the file entry at `path`.
    #[instrument(level = "debug", skip(self, path), fields(path = %path))]
    pub fn delete_file(&self, path: &VaultPath) -> Result<PathBuf, DirectoryError> {
        self.readonly.check("delete file")?;
        let (parent, entry) = self.locate_entry(path)?;
        self.locks.with_locked(&[parent.storage_path.as_path()], || {
            match self.storage.attributes(&entry)? {
                None => Err(DirectoryError::NotFound { path: display(path) }),
                Some(attrs) if attrs.is_dir => Err(DirectoryError::NotAFile { path: display(path) }),
                Some(_) => {
                    self.storage.remove_file(&entry)?;
                    debug!("File deleted");
                    Ok(entry.clone())
                }
            }
        })
    }

    /// Drop all cached resolutions.
    pub fn invalidate(&self) {
        let mut generation = self.generation.write().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.cache.invalidate_all();
        trace!(generation = *generation, "Resolution cache invalidated");
    }
}
