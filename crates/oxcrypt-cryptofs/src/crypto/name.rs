//! AES-SIV filename encryption and directory-id hashing.

use aes_siv::{KeyInit, siv::Aes256Siv};
use base64::{Engine as _, engine::general_purpose};
use data_encoding::BASE32;
use ring::digest;
use unicode_normalization::UnicodeNormalization;

use super::{CryptoError, MasterKey};

/// Hash a directory ID into its 32-character storage hash.
///
/// AES-SIV(dir_id, no associated data), then SHA-1, then RFC 4648 Base32. The
/// caller splits the result into `d/<2>/<30>`.
pub fn hash_dir_id(dir_id: &str, master_key: &MasterKey) -> Result<String, CryptoError> {
    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let associated_data: &[&[u8]] = &[];
        let encrypted = cipher
            .encrypt(associated_data, dir_id.as_bytes())
            .map_err(|_| CryptoError::Encryption { what: "directory id" })?;

        let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &encrypted);
        Ok(BASE32.encode(hashed.as_ref()))
    })?
}

/// Encrypt a filename using AES-SIV with the parent directory ID as associated data.
///
/// The name is NFC-normalized first. Returns base64url (padded) without the
/// `.c9r` extension.
pub fn encrypt_filename(
    name: &str,
    parent_dir_id: &str,
    master_key: &MasterKey,
) -> Result<String, CryptoError> {
    let normalized: String = name.nfc().collect();

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
        let encrypted = cipher
            .encrypt(associated_data, normalized.as_bytes())
            .map_err(|_| CryptoError::Encryption { what: "filename" })?;
        Ok(general_purpose::URL_SAFE.encode(encrypted))
    })?
}

/// Decrypt a filename produced by [`encrypt_filename`] under the same parent.
///
/// A name copied into a different directory fails authentication because the
/// parent id is bound as associated data.
pub fn decrypt_filename(
    encrypted_name: &str,
    parent_dir_id: &str,
    master_key: &MasterKey,
) -> Result<String, CryptoError> {
    let ciphertext = general_purpose::URL_SAFE
        .decode(encrypted_name.as_bytes())
        .map_err(|e| CryptoError::Malformed {
            what: "encrypted filename",
            reason: e.to_string(),
        })?;

    let plaintext = master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
        cipher
            .decrypt(associated_data, &ciphertext)
            .map_err(|_| CryptoError::NameAuthentication {
                encrypted_name: encrypted_name.to_string(),
            })
    })??;

    String::from_utf8(plaintext).map_err(|e| CryptoError::Malformed {
        what: "decrypted filename",
        reason: e.to_string(),
    })
}
