use std::fmt;
use std::sync::{Mutex, PoisonError};

use rand::{CryptoRng, RngCore};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::content::{self, CHUNK_OVERHEAD, FileHeader, HEADER_SIZE, NONCE_SIZE};
use super::{CryptoError, MasterKey, name};
use crate::vault::suite::VaultCipherSuite;

/// Name and content cipher operations bound to one master key and cipher suite.
///
/// A `Cryptor` is created once per mounted vault and shared by reference
/// between all components. Apart from the randomness source, which is behind
/// its own lock, it has no mutable state until [`destroy`](Self::destroy).
pub struct Cryptor {
    suite: VaultCipherSuite,
    key: MasterKey,
    rng: Mutex<Box<dyn CryptoRng + Send>>,
}

impl fmt::Debug for Cryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cryptor")
            .field("suite", &self.suite)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Cryptor {
    pub(crate) fn new(
        suite: VaultCipherSuite,
        key: MasterKey,
        rng: Box<dyn CryptoRng + Send>,
    ) -> Self {
        Self {
            suite,
            key,
            rng: Mutex::new(rng),
        }
    }

    pub fn suite(&self) -> VaultCipherSuite {
        self.suite
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if self.key.is_destroyed() {
            return Err(CryptoError::VaultClosed);
        }
        // A panic mid-draw leaves the generator usable
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.fill_bytes(buf);
        Ok(())
    }

    /// Encrypt a cleartext name for storage under the given parent directory.
    ///
    /// Returns the encoded name without the `.c9r` extension.
    pub fn encrypt_filename(&self, cleartext: &str, parent_dir_id: &str) -> Result<String, CryptoError> {
        match self.suite {
            VaultCipherSuite::SivCtrMac => name::encrypt_filename(cleartext, parent_dir_id, &self.key),
        }
    }

    pub fn decrypt_filename(&self, encrypted: &str, parent_dir_id: &str) -> Result<String, CryptoError> {
        match self.suite {
            VaultCipherSuite::SivCtrMac => name::decrypt_filename(encrypted, parent_dir_id, &self.key),
        }
    }

    /// Storage hash of a directory id (32 Base32 characters).
    pub fn hash_directory_id(&self, dir_id: &str) -> Result<String, CryptoError> {
        match self.suite {
            VaultCipherSuite::SivCtrMac => name::hash_dir_id(dir_id, &self.key),
        }
    }

    /// Generate a fresh directory id (a random UUID string).
    pub fn random_directory_id(&self) -> Result<String, CryptoError> {
        let mut bytes = [0u8; 16];
        self.fill_random(&mut bytes)?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
    }

    /// Create a header with a random nonce and content key.
    pub fn new_file_header(&self) -> Result<FileHeader, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        let mut content_key = Zeroizing::new([0u8; 32]);
        self.fill_random(&mut nonce)?;
        self.fill_random(&mut content_key[..])?;
        Ok(FileHeader::new(nonce, *content_key))
    }

    pub fn encrypt_header(&self, header: &FileHeader) -> Result<[u8; HEADER_SIZE], CryptoError> {
        match self.suite {
            VaultCipherSuite::SivCtrMac => content::encrypt_header(header, &self.key),
        }
    }

    pub fn decrypt_header(&self, ciphertext: &[u8]) -> Result<FileHeader, CryptoError> {
        match self.suite {
            VaultCipherSuite::SivCtrMac => content::decrypt_header(ciphertext, &self.key),
        }
    }

    /// Encrypt one chunk under a freshly drawn nonce.
    pub fn encrypt_chunk(
        &self,
        cleartext: &[u8],
        chunk_index: u64,
        header: &FileHeader,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        self.fill_random(&mut nonce)?;
        match self.suite {
            VaultCipherSuite::SivCtrMac => {
                content::encrypt_chunk(cleartext, chunk_index, &nonce, header, &self.key)
            }
        }
    }

    pub fn decrypt_chunk(
        &self,
        ciphertext: &[u8],
        chunk_index: u64,
        header: &FileHeader,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self.suite {
            VaultCipherSuite::SivCtrMac => {
                content::decrypt_chunk(ciphertext, chunk_index, header, &self.key)
            }
        }
    }

    /// Encrypt a small in-memory blob as a complete ciphertext file.
    ///
    /// Used for metadata files such as `dirid.c9r`. Empty input yields a bare header.
    pub fn encrypt_content(&self, cleartext: &[u8], chunk_size: usize) -> Result<Vec<u8>, CryptoError> {
        let header = self.new_file_header()?;
        let mut out = Vec::with_capacity(
            HEADER_SIZE + cleartext.len() + cleartext.len().div_ceil(chunk_size) * CHUNK_OVERHEAD,
        );
        out.extend_from_slice(&self.encrypt_header(&header)?);
        for (index, chunk) in cleartext.chunks(chunk_size).enumerate() {
            out.extend_from_slice(&self.encrypt_chunk(chunk, index as u64, &header)?);
        }
        Ok(out)
    }

    /// Inverse of [`encrypt_content`](Self::encrypt_content).
    pub fn decrypt_content(
        &self,
        ciphertext: &[u8],
        chunk_size: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.len() < HEADER_SIZE {
            return Err(CryptoError::Malformed {
                what: "file",
                reason: format!("{} bytes is shorter than the file header", ciphertext.len()),
            });
        }
        let (header_bytes, body) = ciphertext.split_at(HEADER_SIZE);
        let header = self.decrypt_header(header_bytes)?;

        let mut out = Zeroizing::new(Vec::with_capacity(body.len()));
        for (index, chunk) in body.chunks(chunk_size + CHUNK_OVERHEAD).enumerate() {
            out.extend_from_slice(&self.decrypt_chunk(chunk, index as u64, &header)?);
        }
        Ok(out)
    }

    /// Zero the master key. Every later operation fails with [`CryptoError::VaultClosed`].
    pub fn destroy(&self) {
        if !self.key.is_destroyed() {
            self.key.destroy();
            info!(suite = %self.suite, "Cryptor destroyed");
        } else {
            debug!("Cryptor already destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.key.is_destroyed()
    }
}
