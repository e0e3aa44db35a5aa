//! Masterkey loading and backup.
//!
//! Loading a vault reads the key file once, unlocks it into a [`Cryptor`] and
//! then makes sure a byte-identical backup named after a hash of the key file
//! exists next to it:
//!
//! 1. On a writable mount the backup is (re)written unless it already matches.
//! 2. If that write fails with a storage error, the existing backup is read
//!    and compared byte for byte. A match is fine; a mismatch is fatal.
//! 3. If the backup cannot be read either, the original write error is returned.
//!
//! Loading on a read-only mount never touches the backup. Asking for a backup
//! explicitly on such a mount is a read-only violation.

use std::path::{Path, PathBuf};

use rand::CryptoRng;
use ring::digest;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::CryptoFsProperties;
use crate::crypto::{CryptoError, Cryptor, KeyAccessError};
use crate::error::ErrorKind;
use crate::readonly::{ReadOnlyViolation, ReadonlyFlag};
use crate::storage::{StorageBackend, StorageError};
use crate::vault::masterkey_file::MasterKeyFile;
use crate::vault::suite::{UnsupportedFormatError, VAULT_VERSION, VaultCipherSuite};

/// Extension of masterkey backup files.
pub const MASTERKEY_BACKUP_SUFFIX: &str = ".bkup";

/// Number of digest bytes in the backup suffix (rendered as 12 hex characters).
const BACKUP_SUFFIX_BYTES: usize = 6;

#[derive(Error, Debug)]
pub enum MasterkeyError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Malformed masterkey file: {0}")]
    Malformed(String),

    #[error("Invalid scrypt parameters: {0}")]
    InvalidScryptParams(String),

    /// Wrapped keys fail their integrity check under the derived KEK.
    #[error("Invalid passphrase or pepper")]
    InvalidPassphrase,

    #[error("Masterkey version MAC verification failed")]
    VersionMacMismatch,

    /// The key file declares a version or cipher combo this mount does not use.
    #[error("Masterkey file does not match the configured format: {0}")]
    UnsupportedFormat(#[from] UnsupportedFormatError),

    /// The configured vault format version itself is unknown.
    #[error(transparent)]
    UnsupportedSuite(UnsupportedFormatError),

    #[error(
        "[INTEGRITY VIOLATION] Backup masterkey file '{}' does not match the working masterkey file and cannot be replaced",
        backup.display()
    )]
    BackupMismatch { backup: PathBuf },

    #[error(transparent)]
    ReadOnly(#[from] ReadOnlyViolation),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<KeyAccessError> for MasterkeyError {
    fn from(err: KeyAccessError) -> Self {
        MasterkeyError::Crypto(err.into())
    }
}

impl MasterkeyError {
    /// Key-file problems (including an unsupported declared version) are
    /// configuration errors from the point of view of whoever mounts the vault.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MasterkeyError::Storage(_) => ErrorKind::Storage,
            MasterkeyError::Malformed(_)
            | MasterkeyError::InvalidScryptParams(_)
            | MasterkeyError::InvalidPassphrase
            | MasterkeyError::VersionMacMismatch
            | MasterkeyError::UnsupportedFormat(_) => ErrorKind::Configuration,
            MasterkeyError::UnsupportedSuite(e) => e.kind(),
            MasterkeyError::BackupMismatch { .. } => ErrorKind::Integrity,
            MasterkeyError::ReadOnly(e) => e.kind(),
            MasterkeyError::Crypto(e) => e.kind(),
        }
    }
}

/// Deterministic suffix naming the backup of a key file: the first six bytes
/// of SHA-256 over the raw file, as twelve uppercase hex characters.
pub fn backup_file_suffix(key_file_bytes: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, key_file_bytes);
    hex::encode_upper(&hash.as_ref()[..BACKUP_SUFFIX_BYTES])
}

/// `<masterkeyFileName><suffix>.bkup`
pub fn backup_file_name(masterkey_filename: &str, key_file_bytes: &[u8]) -> String {
    format!(
        "{masterkey_filename}{}{MASTERKEY_BACKUP_SUFFIX}",
        backup_file_suffix(key_file_bytes)
    )
}

/// Loads key material for one mount and maintains the key file backup.
#[derive(Debug)]
pub struct MasterkeyProvisioner<'a> {
    storage: &'a dyn StorageBackend,
    readonly: &'a ReadonlyFlag,
}

impl<'a> MasterkeyProvisioner<'a> {
    pub fn new(storage: &'a dyn StorageBackend, readonly: &'a ReadonlyFlag) -> Self {
        Self { storage, readonly }
    }

    /// Unlock the vault at `vault_root` and return its [`Cryptor`].
    ///
    /// The vault must already be provisioned: a missing key file is a storage error.
    #[instrument(level = "info", skip(self, properties, rng), fields(vault = %vault_root.display()))]
    pub fn load(
        &self,
        vault_root: &Path,
        properties: &CryptoFsProperties,
        rng: Box<dyn CryptoRng + Send>,
    ) -> Result<Cryptor, MasterkeyError> {
        let suite = VaultCipherSuite::select(properties.vault_format_version())
            .map_err(MasterkeyError::UnsupportedSuite)?;

        let masterkey_path = vault_root.join(properties.masterkey_filename());
        let key_file_bytes = self.storage.read(&masterkey_path)?;
        let key_file = MasterKeyFile::parse(&key_file_bytes)?;

        let cryptor = suite.bind_random_source(rng).create_from_key_file(
            &key_file,
            properties.passphrase(),
            properties.pepper(),
            VAULT_VERSION,
        )?;

        let backup_path =
            vault_root.join(backup_file_name(properties.masterkey_filename(), &key_file_bytes));
        self.ensure_backup(&key_file_bytes, &backup_path)?;

        info!(suite = %suite, "Vault unlocked");
        Ok(cryptor)
    }

    /// Back up the key file `masterkey_filename` without unlocking it.
    ///
    /// Returns the backup path. Follows the same write-or-verify rules as
    /// [`load`](Self::load), but an explicit backup request on a read-only
    /// mount is refused rather than skipped.
    #[instrument(level = "debug", skip(self), fields(vault = %vault_root.display()))]
    pub fn backup_masterkey_file(
        &self,
        vault_root: &Path,
        masterkey_filename: &str,
    ) -> Result<PathBuf, MasterkeyError> {
        self.readonly.check("write masterkey backup")?;
        let key_file_bytes = self.storage.read(&vault_root.join(masterkey_filename))?;
        let backup_path = vault_root.join(backup_file_name(masterkey_filename, &key_file_bytes));
        self.ensure_backup(&key_file_bytes, &backup_path)?;
        Ok(backup_path)
    }

    fn ensure_backup(&self, key_file_bytes: &[u8], backup_path: &Path) -> Result<(), MasterkeyError> {
        if self.readonly.is_set() {
            debug!("Read-only mount, leaving masterkey backup untouched");
            return Ok(());
        }

        match self.write_backup(key_file_bytes, backup_path) {
            Err(MasterkeyError::Storage(write_err)) => {
                warn!(
                    backup = %backup_path.display(),
                    error = %write_err,
                    "Failed to write masterkey backup, comparing existing backup instead"
                );
                self.verify_backup(key_file_bytes, backup_path, write_err)
            }
            other => other,
        }
    }

    fn write_backup(&self, key_file_bytes: &[u8], backup_path: &Path) -> Result<(), MasterkeyError> {
        if let Ok(existing) = self.storage.read(backup_path)
            && existing == key_file_bytes
        {
            debug!(backup = %backup_path.display(), "Masterkey backup is up to date");
            return Ok(());
        }

        self.storage.write_atomic(backup_path, key_file_bytes)?;
        info!(backup = %backup_path.display(), "Masterkey backup written");
        Ok(())
    }

    fn verify_backup(
        &self,
        key_file_bytes: &[u8],
        backup_path: &Path,
        write_err: StorageError,
    ) -> Result<(), MasterkeyError> {
        let existing = match self.storage.read(backup_path) {
            Ok(existing) => existing,
            Err(read_err) => {
                debug!(error = %read_err, "Masterkey backup is not readable either");
                return Err(MasterkeyError::Storage(write_err));
            }
        };

        if existing == key_file_bytes {
            debug!("Existing masterkey backup matches");
            Ok(())
        } else {
            warn!(backup = %backup_path.display(), "Masterkey backup does not match key file");
            Err(MasterkeyError::BackupMismatch {
                backup: backup_path.to_path_buf(),
            })
        }
    }
}
