//! AES-CTR + HMAC-SHA256 file content encryption.
//!
//! # File Header Format (88 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Nonce (IV for AES-CTR) |
//! | 16     | 40   | Encrypted payload (8 reserved bytes `0xFF` + 32-byte content key) |
//! | 56     | 32   | HMAC-SHA256 over nonce + encrypted payload |
//!
//! # Content Chunk Format
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Chunk nonce |
//! | 16     | n    | AES-CTR encrypted payload (at most the configured chunk size) |
//! | 16+n   | 32   | HMAC-SHA256 over (header nonce + chunk index BE + chunk nonce + ciphertext) |
//!
//! Binding the header nonce and the chunk index into every tag means chunks
//! cannot be reordered within a file or transplanted between files.

use std::fmt;

use aes::cipher::{KeyIvInit, StreamCipher};
use generic_array::GenericArray;
use ring::hmac;
use subtle::ConstantTimeEq;
use tracing::{instrument, trace, warn};
use zeroize::Zeroizing;

use super::{CryptoError, MasterKey};

/// Nonce size for AES-CTR (16 bytes)
pub const NONCE_SIZE: usize = 16;

/// HMAC-SHA256 output size (32 bytes)
pub const MAC_SIZE: usize = 32;

/// Per-chunk ciphertext overhead: nonce + MAC
pub const CHUNK_OVERHEAD: usize = NONCE_SIZE + MAC_SIZE;

/// Default cleartext payload size per chunk (32 KiB)
pub const DEFAULT_PAYLOAD_SIZE: usize = 32 * 1024;

/// Header payload size (8 reserved bytes + 32-byte content key)
const HEADER_PAYLOAD_SIZE: usize = 40;

/// File header size: nonce + encrypted payload + MAC
pub const HEADER_SIZE: usize = NONCE_SIZE + HEADER_PAYLOAD_SIZE + MAC_SIZE;

/// AES-256-CTR with big-endian 128-bit counter
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Cleartext file header: the per-file nonce and content key.
pub struct FileHeader {
    nonce: [u8; NONCE_SIZE],
    content_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &hex::encode(self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

impl FileHeader {
    pub fn new(nonce: [u8; NONCE_SIZE], content_key: [u8; 32]) -> Self {
        Self {
            nonce,
            content_key: Zeroizing::new(content_key),
        }
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }
}

/// Encrypt a file header under the master key.
pub fn encrypt_header(
    header: &FileHeader,
    master_key: &MasterKey,
) -> Result<[u8; HEADER_SIZE], CryptoError> {
    let mut out = [0u8; HEADER_SIZE];
    out[..NONCE_SIZE].copy_from_slice(&header.nonce);

    {
        let payload = &mut out[NONCE_SIZE..NONCE_SIZE + HEADER_PAYLOAD_SIZE];
        payload[..8].fill(0xFF);
        payload[8..].copy_from_slice(&header.content_key[..]);
        master_key.with_aes_key(|aes_key| {
            let mut cipher = Aes256Ctr::new(aes_key.into(), (&header.nonce).into());
            cipher.apply_keystream(payload);
        })?;
    }

    let tag = master_key.with_mac_key(|mac_key| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        hmac::sign(&key, &out[..NONCE_SIZE + HEADER_PAYLOAD_SIZE])
    })?;
    out[NONCE_SIZE + HEADER_PAYLOAD_SIZE..].copy_from_slice(tag.as_ref());

    Ok(out)
}

/// Authenticate and decrypt a file header.
#[instrument(level = "trace", skip_all, fields(header_size = encrypted_header.len()))]
pub fn decrypt_header(
    encrypted_header: &[u8],
    master_key: &MasterKey,
) -> Result<FileHeader, CryptoError> {
    if encrypted_header.len() != HEADER_SIZE {
        warn!(
            actual_size = encrypted_header.len(),
            expected_size = HEADER_SIZE,
            "Invalid header size"
        );
        return Err(CryptoError::Malformed {
            what: "file header",
            reason: format!(
                "expected {HEADER_SIZE} bytes, got {} bytes",
                encrypted_header.len()
            ),
        });
    }

    let (authenticated, expected_mac) = encrypted_header.split_at(NONCE_SIZE + HEADER_PAYLOAD_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&authenticated[..NONCE_SIZE]);

    // Authenticate before decrypting
    let valid = master_key.with_mac_key(|mac_key| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        let computed = hmac::sign(&key, authenticated);
        bool::from(computed.as_ref().ct_eq(expected_mac))
    })?;
    if !valid {
        warn!("Header HMAC verification failed");
        return Err(CryptoError::HeaderAuthentication);
    }

    let mut payload = Zeroizing::new([0u8; HEADER_PAYLOAD_SIZE]);
    payload.copy_from_slice(&authenticated[NONCE_SIZE..]);
    master_key.with_aes_key(|aes_key| {
        let mut cipher = Aes256Ctr::new(aes_key.into(), (&nonce).into());
        cipher.apply_keystream(&mut payload[..]);
    })?;

    if payload[..8] != [0xFF; 8] {
        trace!("Header has non-standard reserved bytes");
    }

    let mut content_key = Zeroizing::new([0u8; 32]);
    content_key.copy_from_slice(&payload[8..]);
    Ok(FileHeader { nonce, content_key })
}

fn chunk_mac(
    mac_key: &[u8; 32],
    header_nonce: &[u8; NONCE_SIZE],
    chunk_index: u64,
    chunk_nonce: &[u8],
    ciphertext: &[u8],
) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(header_nonce);
    ctx.update(&chunk_index.to_be_bytes());
    ctx.update(chunk_nonce);
    ctx.update(ciphertext);
    ctx.sign()
}

/// Encrypt one chunk of cleartext with the given chunk nonce.
pub fn encrypt_chunk(
    cleartext: &[u8],
    chunk_index: u64,
    chunk_nonce: &[u8; NONCE_SIZE],
    header: &FileHeader,
    master_key: &MasterKey,
) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(cleartext.len() + CHUNK_OVERHEAD);
    out.extend_from_slice(chunk_nonce);
    out.extend_from_slice(cleartext);

    let mut cipher = Aes256Ctr::new((&*header.content_key).into(), chunk_nonce.into());
    cipher.apply_keystream(&mut out[NONCE_SIZE..]);

    let tag = master_key.with_mac_key(|mac_key| {
        chunk_mac(mac_key, &header.nonce, chunk_index, chunk_nonce, &out[NONCE_SIZE..])
    })?;
    out.extend_from_slice(tag.as_ref());

    trace!(chunk = chunk_index, size = cleartext.len(), "Encrypted chunk");
    Ok(out)
}

/// Authenticate and decrypt one chunk.
///
/// No cleartext is produced unless the tag verifies.
pub fn decrypt_chunk(
    ciphertext: &[u8],
    chunk_index: u64,
    header: &FileHeader,
    master_key: &MasterKey,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < CHUNK_OVERHEAD {
        warn!(
            chunk = chunk_index,
            actual_size = ciphertext.len(),
            "Incomplete chunk"
        );
        return Err(CryptoError::Malformed {
            what: "chunk",
            reason: format!(
                "chunk {chunk_index} too small: expected at least {CHUNK_OVERHEAD} bytes, got {}",
                ciphertext.len()
            ),
        });
    }

    let (chunk_nonce, rest) = ciphertext.split_at(NONCE_SIZE);
    let (payload, expected_mac) = rest.split_at(rest.len() - MAC_SIZE);

    let valid = master_key.with_mac_key(|mac_key| {
        let computed = chunk_mac(mac_key, &header.nonce, chunk_index, chunk_nonce, payload);
        bool::from(computed.as_ref().ct_eq(expected_mac))
    })?;
    if !valid {
        warn!(chunk = chunk_index, "Chunk HMAC verification failed");
        return Err(CryptoError::ChunkAuthentication { chunk: chunk_index });
    }

    let mut cleartext = Zeroizing::new(payload.to_vec());
    let mut cipher = Aes256Ctr::new(
        (&*header.content_key).into(),
        GenericArray::from_slice(chunk_nonce),
    );
    cipher.apply_keystream(&mut cleartext);

    trace!(chunk = chunk_index, size = cleartext.len(), "Decrypted chunk");
    Ok(cleartext)
}
