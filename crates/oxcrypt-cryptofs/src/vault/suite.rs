//! Cipher suite selection.
//!
//! A vault format version maps to exactly one [`VaultCipherSuite`]. The set of
//! suites only ever grows: a new format gets a new variant, and existing
//! variants never change their algorithms.

use std::fmt;
use std::str::FromStr;

use rand::CryptoRng;
use secrecy::SecretString;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::crypto::{Cryptor, MasterKey};
use crate::error::ErrorKind;
use crate::vault::masterkey_file::MasterKeyFile;
use crate::vault::provisioner::MasterkeyError;

/// The vault format version this crate reads and writes.
pub const VAULT_VERSION: u32 = 7;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedFormatError {
    #[error("Unsupported vault format version {0} (supported: {VAULT_VERSION})")]
    Version(u32),

    #[error("Unsupported cipher combo '{0}'")]
    CipherCombo(String),
}

impl UnsupportedFormatError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::UnsupportedFormat
    }
}

/// Filename encryption scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilenameCipher {
    /// AES-SIV (RFC 5297) with the parent directory id as associated data.
    AesSiv,
}

/// File content encryption scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentCipher {
    /// AES-CTR with an HMAC-SHA256 tag per chunk.
    AesCtrHmacSha256,
}

/// Cipher suite bound to a vault format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VaultCipherSuite {
    /// AES-SIV for names, AES-CTR + HMAC-SHA256 for content.
    SivCtrMac,
}

impl VaultCipherSuite {
    /// Pick the suite for a declared vault format version.
    pub fn select(format_version: u32) -> Result<Self, UnsupportedFormatError> {
        match format_version {
            VAULT_VERSION => Ok(VaultCipherSuite::SivCtrMac),
            other => Err(UnsupportedFormatError::Version(other)),
        }
    }

    pub fn filename_cipher(self) -> FilenameCipher {
        match self {
            VaultCipherSuite::SivCtrMac => FilenameCipher::AesSiv,
        }
    }

    pub fn content_cipher(self) -> ContentCipher {
        match self {
            VaultCipherSuite::SivCtrMac => ContentCipher::AesCtrHmacSha256,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VaultCipherSuite::SivCtrMac => "SIV_CTRMAC",
        }
    }

    /// Attach the randomness source used for nonces, content keys and
    /// directory ids. Done once per mount.
    pub fn bind_random_source(self, rng: Box<dyn CryptoRng + Send>) -> CryptorProvider {
        CryptorProvider { suite: self, rng }
    }
}

impl fmt::Display for VaultCipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VaultCipherSuite {
    type Err = UnsupportedFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIV_CTRMAC" => Ok(VaultCipherSuite::SivCtrMac),
            other => Err(UnsupportedFormatError::CipherCombo(other.to_string())),
        }
    }
}

/// A cipher suite with its randomness source, ready to produce a [`Cryptor`].
pub struct CryptorProvider {
    suite: VaultCipherSuite,
    rng: Box<dyn CryptoRng + Send>,
}

impl fmt::Debug for CryptorProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptorProvider")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl CryptorProvider {
    pub fn suite(&self) -> VaultCipherSuite {
        self.suite
    }

    /// Bind an already unlocked master key.
    pub fn create(self, key: MasterKey) -> Cryptor {
        Cryptor::new(self.suite, key, self.rng)
    }

    /// Unlock a parsed key file and bind the resulting key.
    ///
    /// Fails with a configuration error on a wrong passphrase or pepper, a
    /// tampered version MAC, a version other than `expected_version`, or a
    /// cipher combo that does not match this provider's suite.
    #[instrument(level = "debug", skip(self, key_file, passphrase, pepper), fields(suite = %self.suite))]
    pub fn create_from_key_file(
        self,
        key_file: &MasterKeyFile,
        passphrase: &SecretString,
        pepper: &[u8],
        expected_version: u32,
    ) -> Result<Cryptor, MasterkeyError> {
        if key_file.version() != expected_version {
            return Err(UnsupportedFormatError::Version(key_file.version()).into());
        }
        if let Some(combo) = key_file.cipher_combo() {
            let declared: VaultCipherSuite = combo.parse()?;
            if declared != self.suite {
                return Err(UnsupportedFormatError::CipherCombo(combo.to_string()).into());
            }
        }

        let key = key_file.unlock(passphrase, pepper)?;
        debug!("Key file unlocked");
        Ok(self.create(key))
    }
}
