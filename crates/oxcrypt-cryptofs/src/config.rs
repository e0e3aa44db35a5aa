//! Mount properties.
//!
//! ```no_run
//! use oxcrypt_cryptofs::CryptoFsProperties;
//!
//! let properties = CryptoFsProperties::builder()
//!     .passphrase("correct horse battery staple")
//!     .readonly(true)
//!     .build()
//!     .unwrap();
//! assert_eq!(properties.masterkey_filename(), "masterkey.cryptomator");
//! ```

use std::fmt;

use secrecy::SecretString;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::content::DEFAULT_PAYLOAD_SIZE;
use crate::error::ErrorKind;
use crate::vault::suite::VAULT_VERSION;

pub const DEFAULT_MASTERKEY_FILENAME: &str = "masterkey.cryptomator";
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 5;
pub const DEFAULT_DIRECTORY_CACHE_CAPACITY: u64 = 5000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No passphrase configured")]
    MissingPassphrase,

    #[error("Invalid masterkey filename '{0}': must be a plain file name")]
    InvalidMasterkeyFilename(String),

    #[error("Invalid chunk size {0}: must be between 1 and {MAX_CHUNK_SIZE} bytes")]
    InvalidChunkSize(usize),

    #[error("Invalid {name}: must be at least 1")]
    InvalidCacheCapacity { name: &'static str },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// Validated configuration of one mounted vault.
pub struct CryptoFsProperties {
    masterkey_filename: String,
    passphrase: SecretString,
    pepper: Zeroizing<Vec<u8>>,
    vault_format_version: u32,
    readonly: bool,
    chunk_size: usize,
    chunk_cache_capacity: usize,
    directory_cache_capacity: u64,
}

impl fmt::Debug for CryptoFsProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoFsProperties")
            .field("masterkey_filename", &self.masterkey_filename)
            .field("passphrase", &"[REDACTED]")
            .field("pepper", &"[REDACTED]")
            .field("vault_format_version", &self.vault_format_version)
            .field("readonly", &self.readonly)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_cache_capacity", &self.chunk_cache_capacity)
            .field("directory_cache_capacity", &self.directory_cache_capacity)
            .finish()
    }
}

impl CryptoFsProperties {
    pub fn builder() -> CryptoFsPropertiesBuilder {
        CryptoFsPropertiesBuilder::default()
    }

    pub fn masterkey_filename(&self) -> &str {
        &self.masterkey_filename
    }

    pub fn passphrase(&self) -> &SecretString {
        &self.passphrase
    }

    pub fn pepper(&self) -> &[u8] {
        &self.pepper
    }

    pub fn vault_format_version(&self) -> u32 {
        self.vault_format_version
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Cleartext bytes per content chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Maximum number of cached cleartext chunks per open file.
    pub fn chunk_cache_capacity(&self) -> usize {
        self.chunk_cache_capacity
    }

    pub fn directory_cache_capacity(&self) -> u64 {
        self.directory_cache_capacity
    }
}

#[derive(Default)]
pub struct CryptoFsPropertiesBuilder {
    masterkey_filename: Option<String>,
    passphrase: Option<SecretString>,
    pepper: Zeroizing<Vec<u8>>,
    vault_format_version: Option<u32>,
    readonly: bool,
    chunk_size: Option<usize>,
    chunk_cache_capacity: Option<usize>,
    directory_cache_capacity: Option<u64>,
}

impl CryptoFsPropertiesBuilder {
    pub fn masterkey_filename(mut self, name: impl Into<String>) -> Self {
        self.masterkey_filename = Some(name.into());
        self
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(SecretString::from(passphrase.into()));
        self
    }

    pub fn pepper(mut self, pepper: impl Into<Vec<u8>>) -> Self {
        self.pepper = Zeroizing::new(pepper.into());
        self
    }

    pub fn vault_format_version(mut self, version: u32) -> Self {
        self.vault_format_version = Some(version);
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn chunk_cache_capacity(mut self, capacity: usize) -> Self {
        self.chunk_cache_capacity = Some(capacity);
        self
    }

    pub fn directory_cache_capacity(mut self, capacity: u64) -> Self {
        self.directory_cache_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<CryptoFsProperties, ConfigError> {
        let passphrase = self.passphrase.ok_or(ConfigError::MissingPassphrase)?;

        let masterkey_filename = self
            .masterkey_filename
            .unwrap_or_else(|| DEFAULT_MASTERKEY_FILENAME.to_string());
        if masterkey_filename.is_empty()
            || masterkey_filename.contains(['/', '\\'])
            || masterkey_filename == "."
            || masterkey_filename == ".."
        {
            return Err(ConfigError::InvalidMasterkeyFilename(masterkey_filename));
        }

        let chunk_size = self.chunk_size.unwrap_or(DEFAULT_PAYLOAD_SIZE);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(chunk_size));
        }

        let chunk_cache_capacity = self
            .chunk_cache_capacity
            .unwrap_or(DEFAULT_CHUNK_CACHE_CAPACITY);
        if chunk_cache_capacity == 0 {
            return Err(ConfigError::InvalidCacheCapacity {
                name: "chunk cache capacity",
            });
        }

        let directory_cache_capacity = self
            .directory_cache_capacity
            .unwrap_or(DEFAULT_DIRECTORY_CACHE_CAPACITY);
        if directory_cache_capacity == 0 {
            return Err(ConfigError::InvalidCacheCapacity {
                name: "directory cache capacity",
            });
        }

        Ok(CryptoFsProperties {
            masterkey_filename,
            passphrase,
            pepper: self.pepper,
            vault_format_version: self.vault_format_version.unwrap_or(VAULT_VERSION),
            readonly: self.readonly,
            chunk_size,
            chunk_cache_capacity,
            directory_cache_capacity,
        })
    }
}
