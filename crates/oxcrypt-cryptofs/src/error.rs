//! Error types for the cryptofs crate
//!
//! Every component owns its own error enumeration. Each of them maps onto the
//! shared [`ErrorKind`] taxonomy so that callers can branch on the category of a
//! failure without matching on component-specific variants.

use thiserror::Error;

// Re-export error types from submodules
pub use crate::config::ConfigError;
pub use crate::crypto::CryptoError;
pub use crate::fs::{ContentError, ContentContext};
pub use crate::readonly::ReadOnlyViolation;
pub use crate::storage::StorageError;
pub use crate::vault::dirs::DirectoryError;
pub use crate::vault::provisioner::MasterkeyError;
pub use crate::vault::suite::UnsupportedFormatError;

/// Category of a failure.
///
/// `Integrity` and `Configuration` failures are never retried or masked by this
/// crate: recovering from them silently could hide tampering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad passphrase or pepper, malformed key file, invalid properties.
    Configuration,
    /// Authentication failure, backup mismatch, missing or malformed directory marker.
    Integrity,
    /// Mutation attempted while the readonly flag is set.
    ReadOnlyViolation,
    /// Underlying storage I/O failed.
    Storage,
    /// Unknown vault format version or cipher suite.
    UnsupportedFormat,
    /// The filesystem was closed and its key material destroyed.
    VaultClosed,
    /// A cleartext path does not exist.
    NotFound,
    /// A cleartext path already exists.
    AlreadyExists,
    /// The request itself is invalid (e.g. moving a directory into itself).
    InvalidInput,
}

impl ErrorKind {
    /// Whether this kind signals possible tampering or corruption.
    pub fn is_integrity_violation(self) -> bool {
        matches!(self, ErrorKind::Integrity)
    }
}

/// Error returned by the [`CryptoFileSystem`](crate::CryptoFileSystem) facade.
#[derive(Error, Debug)]
pub enum CryptoFsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Masterkey(#[from] MasterkeyError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    ReadOnly(#[from] ReadOnlyViolation),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    UnsupportedFormat(#[from] UnsupportedFormatError),
}

impl CryptoFsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoFsError::Config(e) => e.kind(),
            CryptoFsError::Masterkey(e) => e.kind(),
            CryptoFsError::Directory(e) => e.kind(),
            CryptoFsError::Content(e) => e.kind(),
            CryptoFsError::Storage(e) => e.kind(),
            CryptoFsError::ReadOnly(e) => e.kind(),
            CryptoFsError::Crypto(e) => e.kind(),
            CryptoFsError::UnsupportedFormat(e) => e.kind(),
        }
    }
}
