//! The per-mount filesystem context.
//!
//! [`CryptoFileSystem`] is built once per mounted vault and owns every
//! component: the readonly latch, the [`Cryptor`], the directory mapper and
//! the content engine. It is passed around by reference; nothing is global.
//!
//! ```no_run
//! use oxcrypt_cryptofs::{CryptoFileSystem, CryptoFsProperties, OpenMode};
//!
//! # fn main() -> Result<(), oxcrypt_cryptofs::CryptoFsError> {
//! let properties = CryptoFsProperties::builder().passphrase("secret").build()?;
//! let fs = CryptoFileSystem::open("/path/to/vault", &properties)?;
//!
//! fs.create_directory("/notes")?;
//! let handle = fs.create_file("/notes/todo.txt")?;
//! fs.write(&handle, 0, b"buy milk")?;
//! fs.close_file(handle)?;
//!
//! let handle = fs.open_file("/notes/todo.txt", OpenMode::Read)?;
//! assert_eq!(fs.read(&handle, 0, 64)?, b"buy milk");
//! fs.close_file(handle)?;
//! fs.close()?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::{CryptoRng, SeedableRng};
use tracing::{debug, info, instrument, warn};

use crate::config::CryptoFsProperties;
use crate::crypto::{CryptoError, Cryptor};
use crate::error::CryptoFsError;
use crate::fs::{ContentChunkCipherEngine, FileHandle, OpenMode};
use crate::readonly::ReadonlyFlag;
use crate::storage::{FileStore, LocalStorage, StorageBackend, native_file_store};
use crate::vault::dirs::{DirectoryError, DirectoryIdMapper, EntryKind};
use crate::vault::path::{DirectoryId, VaultPath};
use crate::vault::provisioner::MasterkeyProvisioner;

/// A mounted vault.
pub struct CryptoFileSystem {
    vault_root: PathBuf,
    storage: Arc<dyn StorageBackend>,
    readonly: Arc<ReadonlyFlag>,
    cryptor: Arc<Cryptor>,
    dirs: DirectoryIdMapper,
    content: ContentChunkCipherEngine,
    chunk_size: usize,
    closed: AtomicBool,
}

impl std::fmt::Debug for CryptoFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoFileSystem")
            .field("vault_root", &self.vault_root)
            .field("readonly", &self.readonly.is_set())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl CryptoFileSystem {
    /// Unlock the vault at `vault_root` on the local filesystem.
    pub fn open(
        vault_root: impl AsRef<Path>,
        properties: &CryptoFsProperties,
    ) -> Result<Self, CryptoFsError> {
        Self::open_with(
            vault_root,
            properties,
            Arc::new(LocalStorage::new()),
            Box::new(rand::rngs::StdRng::from_os_rng()),
        )
    }

    /// Unlock a vault on an arbitrary storage backend with an explicit
    /// randomness source.
    #[instrument(level = "info", skip_all, fields(vault = %vault_root.as_ref().display(), readonly = properties.readonly()))]
    pub fn open_with(
        vault_root: impl AsRef<Path>,
        properties: &CryptoFsProperties,
        storage: Arc<dyn StorageBackend>,
        rng: Box<dyn CryptoRng + Send>,
    ) -> Result<Self, CryptoFsError> {
        let vault_root = vault_root.as_ref().to_path_buf();
        let readonly = Arc::new(ReadonlyFlag::new(properties.readonly()));

        let cryptor = MasterkeyProvisioner::new(storage.as_ref(), &readonly).load(
            &vault_root,
            properties,
            rng,
        )?;
        let cryptor = Arc::new(cryptor);

        let dirs = DirectoryIdMapper::new(
            vault_root.clone(),
            Arc::clone(&storage),
            Arc::clone(&cryptor),
            Arc::clone(&readonly),
            properties.directory_cache_capacity(),
            properties.chunk_size(),
        );
        let root = dirs.root()?;
        if storage.attributes(&root.storage_path)?.is_none() {
            cryptor.destroy();
            return Err(DirectoryError::MissingStorage {
                path: VaultPath::root().to_string(),
                storage: root.storage_path,
            }
            .into());
        }

        let content = ContentChunkCipherEngine::new(
            Arc::clone(&storage),
            Arc::clone(&cryptor),
            Arc::clone(&readonly),
            properties.chunk_size(),
            properties.chunk_cache_capacity(),
        );

        info!(suite = %cryptor.suite(), "Filesystem opened");
        Ok(Self {
            vault_root,
            storage,
            readonly,
            cryptor,
            dirs,
            content,
            chunk_size: properties.chunk_size(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), CryptoFsError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CryptoError::VaultClosed.into());
        }
        Ok(())
    }

    pub fn vault_root(&self) -> &Path {
        &self.vault_root
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.is_set()
    }

    /// Switch the mount to read-only. There is no way back.
    pub fn set_readonly(&self) {
        self.readonly.set();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The directory mapper, for callers that need ciphertext locations.
    pub fn directory_mapper(&self) -> &DirectoryIdMapper {
        &self.dirs
    }

    pub fn entry_kind(&self, path: impl AsRef<str>) -> Result<Option<EntryKind>, CryptoFsError> {
        self.ensure_open()?;
        Ok(self.dirs.entry_kind(&VaultPath::new(path))?)
    }

    pub fn create_directory(&self, path: impl AsRef<str>) -> Result<DirectoryId, CryptoFsError> {
        self.ensure_open()?;
        Ok(self.dirs.create_directory(&VaultPath::new(path))?)
    }

    /// Move or rename a file or directory. Open handles on a moved file follow it.
    pub fn move_entry(&self, src: impl AsRef<str>, dst: impl AsRef<str>) -> Result<(), CryptoFsError> {
        self.ensure_open()?;
        let (src, dst) = (VaultPath::new(src), VaultPath::new(dst));
        self.dirs
            .move_entry_with(&src, &dst, |from, to| self.content.relocate(from, to))?;
        Ok(())
    }

    pub fn delete_file(&self, path: impl AsRef<str>) -> Result<(), CryptoFsError> {
        self.ensure_open()?;
        let entry = self.dirs.delete_file(&VaultPath::new(path))?;
        self.content.mark_deleted(&entry);
        Ok(())
    }

    /// Delete an empty directory.
    pub fn delete_directory(&self, path: impl AsRef<str>) -> Result<(), CryptoFsError> {
        self.ensure_open()?;
        Ok(self.dirs.delete_directory(&VaultPath::new(path))?)
    }

    /// Open an existing file.
    pub fn open_file(&self, path: impl AsRef<str>, mode: OpenMode) -> Result<FileHandle, CryptoFsError> {
        self.ensure_open()?;
        let path = VaultPath::new(path);
        match self.dirs.entry_kind(&path)? {
            None => Err(DirectoryError::NotFound {
                path: path.to_string(),
            }
            .into()),
            Some(EntryKind::Directory) => Err(DirectoryError::NotAFile {
                path: path.to_string(),
            }
            .into()),
            Some(EntryKind::File) => {
                let entry = self.dirs.ciphertext_file_path(&path)?;
                Ok(self.content.open(&entry, mode)?)
            }
        }
    }

    /// Create a new empty file and open it for writing. Fails if `path` exists.
    pub fn create_file(&self, path: impl AsRef<str>) -> Result<FileHandle, CryptoFsError> {
        self.ensure_open()?;
        self.readonly.check("create file")?;
        let path = VaultPath::new(path);
        let empty = self.cryptor.encrypt_content(&[], self.chunk_size)?;
        let entry = self.dirs.create_file_entry(&path, &empty)?;
        Ok(self.content.open(&entry, OpenMode::ReadWrite)?)
    }

    pub fn read(&self, handle: &FileHandle, offset: u64, len: usize) -> Result<Vec<u8>, CryptoFsError> {
        self.ensure_open()?;
        Ok(self.content.read(handle, offset, len)?)
    }

    pub fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> Result<usize, CryptoFsError> {
        self.ensure_open()?;
        Ok(self.content.write(handle, offset, data)?)
    }

    pub fn truncate(&self, handle: &FileHandle, size: u64) -> Result<(), CryptoFsError> {
        self.ensure_open()?;
        Ok(self.content.truncate(handle, size)?)
    }

    pub fn flush(&self, handle: &FileHandle) -> Result<(), CryptoFsError> {
        self.ensure_open()?;
        Ok(self.content.flush(handle)?)
    }

    pub fn file_size(&self, handle: &FileHandle) -> Result<u64, CryptoFsError> {
        self.ensure_open()?;
        Ok(self.content.size(handle)?)
    }

    pub fn close_file(&self, handle: FileHandle) -> Result<(), CryptoFsError> {
        Ok(self.content.close(handle)?)
    }

    /// Capacity of the volume holding the vault, if the backend can tell.
    pub fn file_store(&self) -> Option<FileStore> {
        native_file_store(self.storage.as_ref(), &self.vault_root)
    }

    /// Flush all open files and destroy the key material.
    ///
    /// Every later call on this filesystem or its handles fails with a
    /// vault-closed error. Closing twice is a no-op.
    #[instrument(level = "info", skip(self), fields(vault = %self.vault_root.display()))]
    pub fn close(&self) -> Result<(), CryptoFsError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Filesystem already closed");
            return Ok(());
        }
        let flushed = self.content.shutdown();
        self.cryptor.destroy();
        self.dirs.invalidate();
        info!("Filesystem closed");
        flushed.map_err(CryptoFsError::from)
    }
}

impl Drop for CryptoFileSystem {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close filesystem cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::vault::masterkey_file::{MasterKeyFile, ScryptCost};
    use crate::crypto::MasterKey;
    use rand_chacha::ChaCha20Rng;
    use secrecy::SecretString;
    use tempfile::TempDir;

    fn provision(dir: &TempDir) -> CryptoFsProperties {
        let key = MasterKey::new([0x41; 32], [0x42; 32]);
        let file = MasterKeyFile::create(
            &key,
            &SecretString::from("pw".to_string()),
            &[],
            7,
            ScryptCost::fast(),
        )
        .unwrap();
        std::fs::write(dir.path().join("masterkey.cryptomator"), file.to_json_bytes().unwrap()).unwrap();

        let props = CryptoFsProperties::builder().passphrase("pw").build().unwrap();
        let fs = CryptoFileSystem::open_with(
            dir.path(),
            &props,
            Arc::new(LocalStorage::new()),
            Box::new(ChaCha20Rng::seed_from_u64(1)),
        );
        // Root storage does not exist yet in a bare vault
        assert_eq!(fs.unwrap_err().kind(), ErrorKind::Integrity);
        props
    }

    fn create_root(dir: &TempDir, props: &CryptoFsProperties) {
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new());
        let readonly = ReadonlyFlag::new(false);
        let cryptor = MasterkeyProvisioner::new(storage.as_ref(), &readonly)
            .load(dir.path(), props, Box::new(ChaCha20Rng::seed_from_u64(2)))
            .unwrap();
        let mapper = DirectoryIdMapper::new(
            dir.path(),
            storage,
            Arc::new(cryptor),
            Arc::new(readonly),
            10,
            props.chunk_size(),
        );
        std::fs::create_dir_all(mapper.root().unwrap().storage_path).unwrap();
    }

    #[test]
    fn test_open_requires_root_storage() {
        let dir = TempDir::new().unwrap();
        let props = provision(&dir);
        create_root(&dir, &props);
        let fs = CryptoFileSystem::open(dir.path(), &props).unwrap();
        assert!(!fs.is_readonly());
        assert!(fs.file_store().is_some());
    }

    #[test]
    fn test_close_fails_everything_afterwards() {
        let dir = TempDir::new().unwrap();
        let props = provision(&dir);
        create_root(&dir, &props);
        let fs = CryptoFileSystem::open(dir.path(), &props).unwrap();
        let handle = fs.create_file("/a.txt").unwrap();
        fs.write(&handle, 0, b"data").unwrap();

        fs.close().unwrap();
        fs.close().unwrap();
        assert!(fs.is_closed());

        assert_eq!(fs.create_directory("/d").unwrap_err().kind(), ErrorKind::VaultClosed);
        assert_eq!(fs.read(&handle, 0, 4).unwrap_err().kind(), ErrorKind::VaultClosed);
        assert_eq!(fs.close_file(handle).unwrap_err().kind(), ErrorKind::VaultClosed);

        // The write was flushed before the key was destroyed
        let reopened = CryptoFileSystem::open(dir.path(), &props).unwrap();
        let handle = reopened.open_file("/a.txt", OpenMode::Read).unwrap();
        assert_eq!(reopened.read(&handle, 0, 16).unwrap(), b"data");
    }
}
