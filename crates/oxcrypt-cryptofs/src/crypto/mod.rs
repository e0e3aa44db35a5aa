//! Cryptographic building blocks for the vault.
//!
//! [`Cryptor`] is the only type the rest of the crate talks to; the submodules
//! hold the scheme-level functions it dispatches to.

pub mod content;
mod cryptor;
pub mod key_wrap;
pub mod keys;
pub mod name;

pub use cryptor::Cryptor;
pub use keys::{KeyAccessError, MasterKey};

use thiserror::Error;

use crate::error::ErrorKind;

/// Errors raised by cipher operations.
///
/// Authentication failures are reported as `[INTEGRITY VIOLATION]`: they mean
/// the ciphertext was modified, truncated, swapped from another location, or
/// produced under a different key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The owning filesystem was closed and the key destroyed.
    #[error("Vault is closed: key material has been destroyed")]
    VaultClosed,

    #[error("[INTEGRITY VIOLATION] File header authentication failed")]
    HeaderAuthentication,

    #[error("[INTEGRITY VIOLATION] Authentication failed for chunk {chunk}")]
    ChunkAuthentication { chunk: u64 },

    #[error("[INTEGRITY VIOLATION] Failed to decrypt filename '{encrypted_name}': authentication failed")]
    NameAuthentication { encrypted_name: String },

    /// Structurally invalid ciphertext (wrong length, bad encoding).
    #[error("[INTEGRITY VIOLATION] Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// Encryption rejected its input (only possible for oversized inputs).
    #[error("Encryption failed for {what}")]
    Encryption { what: &'static str },
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::VaultClosed => ErrorKind::VaultClosed,
            CryptoError::HeaderAuthentication
            | CryptoError::ChunkAuthentication { .. }
            | CryptoError::NameAuthentication { .. }
            | CryptoError::Malformed { .. } => ErrorKind::Integrity,
            CryptoError::Encryption { .. } => ErrorKind::InvalidInput,
        }
    }
}

impl From<KeyAccessError> for CryptoError {
    fn from(err: KeyAccessError) -> Self {
        match err {
            KeyAccessError::Destroyed => CryptoError::VaultClosed,
        }
    }
}
