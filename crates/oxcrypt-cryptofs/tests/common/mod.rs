//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use oxcrypt_cryptofs::crypto::MasterKey;
use oxcrypt_cryptofs::readonly::ReadonlyFlag;
use oxcrypt_cryptofs::storage::{Attributes, FileStore, StorageError};
use oxcrypt_cryptofs::vault::{
    DirectoryIdMapper, MasterKeyFile, MasterkeyProvisioner, ScryptCost, backup_file_name,
};
use oxcrypt_cryptofs::{CryptoFileSystem, CryptoFsProperties, LocalStorage, StorageBackend};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use secrecy::SecretString;
use tempfile::TempDir;

pub const TEST_PASSPHRASE: &str = "test-passphrase-12345";
pub const MASTERKEY_FILENAME: &str = "masterkey.cryptomator";

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic key material for fixtures.
pub fn test_master_key() -> MasterKey {
    let mut aes_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    for i in 0..32u8 {
        aes_key[i as usize] = 0x10u8.wrapping_add(i);
        mac_key[i as usize] = 0x80u8.wrapping_add(i.wrapping_mul(3));
    }
    MasterKey::new(aes_key, mac_key)
}

/// A provisioned vault in a temporary directory.
pub struct TestVault {
    _dir: TempDir,
    root: PathBuf,
}

impl TestVault {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path().join("vault");
        std::fs::create_dir(&root).expect("Failed to create vault dir");

        let key_file = MasterKeyFile::create(
            &test_master_key(),
            &SecretString::from(TEST_PASSPHRASE.to_string()),
            &[],
            7,
            ScryptCost::fast(),
        )
        .expect("Failed to create key file");
        std::fs::write(
            root.join(MASTERKEY_FILENAME),
            key_file.to_json_bytes().expect("Failed to serialize key file"),
        )
        .expect("Failed to write key file");

        let vault = Self { _dir: dir, root };
        let root_storage = vault.mapper().root().expect("root").storage_path;
        std::fs::create_dir_all(root_storage).expect("Failed to create root storage");
        vault
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn properties(&self) -> CryptoFsProperties {
        CryptoFsProperties::builder()
            .passphrase(TEST_PASSPHRASE)
            .build()
            .expect("valid properties")
    }

    pub fn readonly_properties(&self) -> CryptoFsProperties {
        CryptoFsProperties::builder()
            .passphrase(TEST_PASSPHRASE)
            .readonly(true)
            .build()
            .expect("valid properties")
    }

    pub fn open(&self) -> CryptoFileSystem {
        CryptoFileSystem::open(&self.root, &self.properties()).expect("Failed to open vault")
    }

    pub fn open_with_storage(
        &self,
        properties: &CryptoFsProperties,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<CryptoFileSystem, oxcrypt_cryptofs::CryptoFsError> {
        CryptoFileSystem::open_with(
            &self.root,
            properties,
            storage,
            Box::new(ChaCha20Rng::seed_from_u64(7)),
        )
    }

    /// A standalone mapper over this vault, independent of any mounted filesystem.
    pub fn mapper(&self) -> DirectoryIdMapper {
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new());
        let readonly = ReadonlyFlag::new(true);
        let properties = self.properties();
        let cryptor = MasterkeyProvisioner::new(storage.as_ref(), &readonly)
            .load(&self.root, &properties, Box::new(ChaCha20Rng::seed_from_u64(1)))
            .expect("Failed to load masterkey");
        DirectoryIdMapper::new(
            self.root.clone(),
            storage,
            Arc::new(cryptor),
            Arc::new(readonly),
            100,
            properties.chunk_size(),
        )
    }

    pub fn masterkey_path(&self) -> PathBuf {
        self.root.join(MASTERKEY_FILENAME)
    }

    pub fn backup_path(&self) -> PathBuf {
        let bytes = std::fs::read(self.masterkey_path()).expect("Failed to read key file");
        self.root.join(backup_file_name(MASTERKEY_FILENAME, &bytes))
    }
}

/// Every regular file below `dir`, with its content, sorted by path.
pub fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    fn walk(dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in std::fs::read_dir(dir).expect("read_dir") {
            let path = entry.expect("dir entry").path();
            if path.is_dir() {
                walk(&path, out);
            } else {
                let data = std::fs::read(&path).expect("read");
                out.push((path, data));
            }
        }
    }
    let mut out = Vec::new();
    walk(dir, &mut out);
    out.sort();
    out
}

/// [`LocalStorage`] that refuses selected writes.
///
/// Writes to masterkey backups can be failed on their own, or every write can
/// be failed to emulate a storage that was remounted read-only. Reads of
/// backups can additionally be failed a given number of times.
#[derive(Debug, Default)]
pub struct FailingStorage {
    inner: LocalStorage,
    fail_backups: AtomicBool,
    fail_all_writes: AtomicBool,
    failed_backup_reads: AtomicUsize,
    backup_reads: AtomicUsize,
}

fn is_backup(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "bkup")
}

fn injected(op: &'static str, path: &Path) -> StorageError {
    StorageError::new(
        op,
        path,
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, "injected failure"),
    )
}

impl FailingStorage {
    pub fn failing_backups() -> Self {
        let storage = Self::default();
        storage.fail_backups.store(true, Ordering::SeqCst);
        storage
    }

    pub fn failing_all_writes() -> Self {
        let storage = Self::default();
        storage.fail_all_writes.store(true, Ordering::SeqCst);
        storage
    }

    /// Fail the next `count` reads of a backup file.
    pub fn with_failed_backup_reads(self, count: usize) -> Self {
        self.failed_backup_reads.store(count, Ordering::SeqCst);
        self
    }

    /// Backup reads attempted so far, failed ones included.
    pub fn backup_reads(&self) -> usize {
        self.backup_reads.load(Ordering::SeqCst)
    }

    fn check(&self, op: &'static str, path: &Path) -> Result<(), StorageError> {
        if self.fail_all_writes.load(Ordering::SeqCst)
            || (is_backup(path) && self.fail_backups.load(Ordering::SeqCst))
        {
            return Err(injected(op, path));
        }
        Ok(())
    }
}

impl StorageBackend for FailingStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        if is_backup(path) {
            self.backup_reads.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .failed_backup_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(injected("read", path));
            }
        }
        self.inner.read(path)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        self.check("write", path)?;
        self.inner.write_atomic(path, data)
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        self.check("create", path)?;
        self.inner.create_new(path, data)
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.inner.read_at(path, offset, buf)
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.check("write", path)?;
        self.inner.write_at(path, offset, data)
    }

    fn set_len(&self, path: &Path, len: u64) -> Result<(), StorageError> {
        self.check("truncate", path)?;
        self.inner.set_len(path, len)
    }

    fn attributes(&self, path: &Path) -> Result<Option<Attributes>, StorageError> {
        self.inner.attributes(path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        self.inner.list(dir)
    }

    fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        self.check("create directory", path)?;
        self.inner.create_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), StorageError> {
        self.check("create directory", path)?;
        self.inner.create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> Result<(), StorageError> {
        self.check("remove", path)?;
        self.inner.remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> Result<(), StorageError> {
        self.check("remove directory", path)?;
        self.inner.remove_dir(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), StorageError> {
        self.check("remove directory", path)?;
        self.inner.remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        self.check("rename", from)?;
        self.inner.rename(from, to)
    }

    fn file_store(&self, path: &Path) -> Result<FileStore, StorageError> {
        self.inner.file_store(path)
    }
}
