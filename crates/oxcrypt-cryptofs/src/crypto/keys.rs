#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{PoisonError, RwLock};

use generic_array::{GenericArray, typenum::U64};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// Error type for key access operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KeyAccessError {
    /// The key was destroyed when its filesystem was closed.
    #[error("Key material has been destroyed")]
    Destroyed,
}

struct KeyPair {
    aes: SecretBox<[u8; 32]>,
    mac: SecretBox<[u8; 32]>,
}

/// Master key pair for vault operations.
///
/// Holds the 256-bit AES encryption key and the 256-bit MAC key. Both live in
/// [`SecretBox`] containers that zero their memory on drop.
///
/// Access to key material is only possible through scoped callbacks
/// (`with_aes_key`, `with_mac_key`, `with_siv_key`), so the raw bytes never
/// escape the closure they are lent to.
///
/// # Lifetime
///
/// A master key is owned by exactly one [`Cryptor`](super::Cryptor). Calling
/// [`destroy`](Self::destroy) zeroes both keys immediately; every later access
/// fails with [`KeyAccessError::Destroyed`].
pub struct MasterKey {
    keys: RwLock<Option<KeyPair>>,
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("keys", &"[REDACTED]")
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl MasterKey {
    /// Create a new master key pair from raw key material.
    ///
    /// The arrays are moved into zeroizing containers; callers holding copies
    /// of the input are responsible for erasing them.
    pub fn new(aes_key: [u8; 32], mac_key: [u8; 32]) -> Self {
        MasterKey {
            keys: RwLock::new(Some(KeyPair {
                aes: SecretBox::new(Box::new(aes_key)),
                mac: SecretBox::new(Box::new(mac_key)),
            })),
        }
    }

    /// Generate a new random master key pair from the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut aes_key = Zeroizing::new([0u8; 32]);
        let mut mac_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut aes_key[..]);
        rand::rng().fill_bytes(&mut mac_key[..]);
        Self::new(*aes_key, *mac_key)
    }

    /// Execute a function with access to just the AES encryption key.
    pub fn with_aes_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        let guard = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let pair = guard.as_ref().ok_or(KeyAccessError::Destroyed)?;
        Ok(f(pair.aes.expose_secret()))
    }

    /// Execute a function with access to just the MAC key.
    pub fn with_mac_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        let guard = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let pair = guard.as_ref().ok_or(KeyAccessError::Destroyed)?;
        Ok(f(pair.mac.expose_secret()))
    }

    /// Execute a function with access to both keys in AES-SIV order (MAC || AES).
    ///
    /// The 64-byte combined key is zeroed after the callback completes.
    pub fn with_siv_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&GenericArray<u8, U64>) -> R,
    {
        struct ZeroizeOnDrop(GenericArray<u8, U64>);

        impl Drop for ZeroizeOnDrop {
            fn drop(&mut self) {
                self.0.as_mut_slice().zeroize();
            }
        }

        let guard = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let pair = guard.as_ref().ok_or(KeyAccessError::Destroyed)?;

        // SIV takes the MAC key first, then the AES key
        let mut key = ZeroizeOnDrop(GenericArray::<u8, U64>::default());
        key.0[..32].copy_from_slice(pair.mac.expose_secret());
        key.0[32..].copy_from_slice(pair.aes.expose_secret());
        drop(guard);

        Ok(f(&key.0))
    }

    /// Zero both keys. Idempotent.
    pub fn destroy(&self) {
        let mut guard = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!("Master key destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
