//! The masterkey file (`masterkey.cryptomator`).
//!
//! A JSON document holding both vault keys wrapped (RFC 3394) under a key
//! encryption key derived from the passphrase with scrypt:
//!
//! ```text
//! KEK = scrypt(NFC(passphrase), salt || pepper, N, r, p = 1, 32 bytes)
//! ```
//!
//! `versionMac` is HMAC-SHA256 over the big-endian format version under the MAC
//! key, so the declared version cannot be altered without the keys.

use ring::hmac;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use tracing::{debug, instrument, warn};
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use crate::crypto::MasterKey;
use crate::crypto::key_wrap::{self, KeyWrapError};
use crate::vault::provisioner::MasterkeyError;

const DEFAULT_SCRYPT_SALT_LENGTH: usize = 8;
const DEFAULT_SCRYPT_COST_PARAM_LOG2: u8 = 15;
const DEFAULT_SCRYPT_BLOCK_SIZE: u32 = 8;
const SCRYPT_PARALLELIZATION: u32 = 1;

/// N = 2^10, for test fixtures only.
const FAST_SCRYPT_COST_PARAM_LOG2: u8 = 10;

/// scrypt cost settings used when writing a new key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptCost {
    pub log2_n: u8,
    pub block_size: u32,
}

impl ScryptCost {
    /// Weak parameters for tests and fixtures. Never use for real vaults.
    pub const fn fast() -> Self {
        Self {
            log2_n: FAST_SCRYPT_COST_PARAM_LOG2,
            block_size: DEFAULT_SCRYPT_BLOCK_SIZE,
        }
    }
}

impl Default for ScryptCost {
    /// N = 2^15, r = 8, unless `OXCRYPT_FAST_KDF=1` is set in the environment.
    fn default() -> Self {
        let fast = std::env::var("OXCRYPT_FAST_KDF")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if fast {
            Self::fast()
        } else {
            Self {
                log2_n: DEFAULT_SCRYPT_COST_PARAM_LOG2,
                block_size: DEFAULT_SCRYPT_BLOCK_SIZE,
            }
        }
    }
}

/// Parsed masterkey file.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyFile {
    version: u32,

    #[serde_as(as = "Base64")]
    scrypt_salt: Vec<u8>,

    /// scrypt N, a power of two.
    scrypt_cost_param: u32,

    /// scrypt r.
    scrypt_block_size: u32,

    /// Wrapped AES key.
    #[serde_as(as = "Base64")]
    primary_master_key: Vec<u8>,

    /// Wrapped MAC key.
    #[serde_as(as = "Base64")]
    hmac_master_key: Vec<u8>,

    #[serde_as(as = "Base64")]
    version_mac: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    cipher_combo: Option<String>,
}

impl MasterKeyFile {
    /// Parse the raw bytes of a key file.
    pub fn parse(bytes: &[u8]) -> Result<Self, MasterkeyError> {
        serde_json::from_slice(bytes).map_err(|e| {
            warn!(error = %e, "Masterkey file is not valid JSON");
            MasterkeyError::Malformed(e.to_string())
        })
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, MasterkeyError> {
        serde_json::to_vec_pretty(self).map_err(|e| MasterkeyError::Malformed(e.to_string()))
    }

    /// Declared vault format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn cipher_combo(&self) -> Option<&str> {
        self.cipher_combo.as_deref()
    }

    fn scrypt_params(log2_n: u8, r: u32) -> Result<scrypt::Params, MasterkeyError> {
        scrypt::Params::new(log2_n, r, SCRYPT_PARALLELIZATION, 32).map_err(|e| {
            MasterkeyError::InvalidScryptParams(format!(
                "N=2^{log2_n}, r={r}, p={SCRYPT_PARALLELIZATION}: {e}"
            ))
        })
    }

    fn derive_kek(
        passphrase: &SecretString,
        salt: &[u8],
        pepper: &[u8],
        params: &scrypt::Params,
    ) -> Result<Zeroizing<[u8; 32]>, MasterkeyError> {
        let normalized = Zeroizing::new(passphrase.expose_secret().nfc().collect::<String>());

        let mut salt_and_pepper = Zeroizing::new(Vec::with_capacity(salt.len() + pepper.len()));
        salt_and_pepper.extend_from_slice(salt);
        salt_and_pepper.extend_from_slice(pepper);

        let mut kek = Zeroizing::new([0u8; 32]);
        scrypt::scrypt(normalized.as_bytes(), &salt_and_pepper, params, &mut kek[..])
            .map_err(|e| MasterkeyError::InvalidScryptParams(e.to_string()))?;
        Ok(kek)
    }

    fn unwrap_32(wrapped: &[u8], kek: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, MasterkeyError> {
        let raw = key_wrap::unwrap_key(wrapped, kek).map_err(|e| match e {
            KeyWrapError::IntegrityCheck => MasterkeyError::InvalidPassphrase,
            other => MasterkeyError::Malformed(other.to_string()),
        })?;
        if raw.len() != 32 {
            return Err(MasterkeyError::Malformed(format!(
                "unwrapped key has {} bytes, expected 32",
                raw.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&raw);
        Ok(key)
    }

    /// Derive the KEK, unwrap both keys and check the version MAC.
    #[instrument(level = "debug", skip_all, fields(version = self.version))]
    pub fn unlock(&self, passphrase: &SecretString, pepper: &[u8]) -> Result<MasterKey, MasterkeyError> {
        let cost = self.scrypt_cost_param;
        if cost < 2 || !cost.is_power_of_two() {
            return Err(MasterkeyError::InvalidScryptParams(format!(
                "cost parameter {cost} is not a power of two"
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let log2_n = cost.trailing_zeros() as u8;
        let params = Self::scrypt_params(log2_n, self.scrypt_block_size)?;
        let kek = Self::derive_kek(passphrase, &self.scrypt_salt, pepper, &params)?;

        let aes_key = Self::unwrap_32(&self.primary_master_key, &kek)?;
        let mac_key = Self::unwrap_32(&self.hmac_master_key, &kek)?;

        let mac = hmac::Key::new(hmac::HMAC_SHA256, &mac_key[..]);
        hmac::verify(&mac, &self.version.to_be_bytes(), &self.version_mac).map_err(|_| {
            warn!("Masterkey version MAC mismatch");
            MasterkeyError::VersionMacMismatch
        })?;

        debug!("Masterkey unwrapped");
        Ok(MasterKey::new(*aes_key, *mac_key))
    }

    /// Wrap `master_key` into a new key file.
    ///
    /// Used to provision fixtures and by tooling that changes passphrases;
    /// this crate itself never writes key files.
    #[instrument(level = "debug", skip(master_key, passphrase, pepper))]
    pub fn create(
        master_key: &MasterKey,
        passphrase: &SecretString,
        pepper: &[u8],
        version: u32,
        cost: ScryptCost,
    ) -> Result<Self, MasterkeyError> {
        use rand::RngCore;

        let mut salt = vec![0u8; DEFAULT_SCRYPT_SALT_LENGTH];
        rand::rng().fill_bytes(&mut salt);

        let params = Self::scrypt_params(cost.log2_n, cost.block_size)?;
        let kek = Self::derive_kek(passphrase, &salt, pepper, &params)?;

        let primary_master_key = master_key
            .with_aes_key(|key| key_wrap::wrap_key(key, &kek))?
            .map_err(|e| MasterkeyError::Malformed(e.to_string()))?;
        let hmac_master_key = master_key
            .with_mac_key(|key| key_wrap::wrap_key(key, &kek))?
            .map_err(|e| MasterkeyError::Malformed(e.to_string()))?;
        let version_mac = master_key.with_mac_key(|key| {
            let mac = hmac::Key::new(hmac::HMAC_SHA256, key);
            hmac::sign(&mac, &version.to_be_bytes()).as_ref().to_vec()
        })?;

        Ok(MasterKeyFile {
            version,
            scrypt_salt: salt,
            scrypt_cost_param: 1u32 << cost.log2_n,
            scrypt_block_size: cost.block_size,
            primary_master_key,
            hmac_master_key,
            version_mac,
            cipher_combo: None,
        })
    }

    /// Declare the cipher combo explicitly in the file.
    pub fn with_cipher_combo(mut self, combo: impl Into<String>) -> Self {
        self.cipher_combo = Some(combo.into());
        self
    }
}
