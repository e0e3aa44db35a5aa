#![forbid(unsafe_code)]

/*!
    AES key wrapping as defined in [IETF RFC3394](https://datatracker.ietf.org/doc/html/rfc3394),
    restricted to 256-bit key encryption keys.

    Masterkey files store both vault keys wrapped under a passphrase-derived KEK.
    A wrong passphrase surfaces as [`KeyWrapError::IntegrityCheck`] on unwrap.
*/

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// IV from RFC3394 Section 2.2.3.1
const IV_3394: [u8; 8] = [0xa6; 8];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyWrapError {
    #[error("Key data must be a multiple of 64 bits and at least 128 bits, got {0} bytes")]
    InvalidPlaintextLength(usize),

    #[error("Wrapped key must be a multiple of 64 bits and at least 192 bits, got {0} bytes")]
    InvalidCiphertextLength(usize),

    /// The unwrapped integrity register does not match the RFC3394 IV.
    #[error("The integrity check failed")]
    IntegrityCheck,
}

#[inline]
fn xor_step(register: &mut [u8; 8], t: u64) {
    for (a, b) in register.iter_mut().zip(t.to_be_bytes()) {
        *a ^= b;
    }
}

/// Wrap `plaintext` under `kek`.
pub fn wrap_key(plaintext: &[u8], kek: &[u8; 32]) -> Result<Vec<u8>, KeyWrapError> {
    if plaintext.len() % 8 != 0 || plaintext.len() < 16 {
        return Err(KeyWrapError::InvalidPlaintextLength(plaintext.len()));
    }

    let cipher = Aes256::new(kek.into());
    let n = plaintext.len() / 8;
    let mut a = IV_3394;
    let mut registers = Zeroizing::new(plaintext.to_vec());
    let mut block = aes::Block::default();

    for j in 0..6 {
        for (i, r) in registers.chunks_exact_mut(8).enumerate() {
            // B = AES(K, A | R[i])
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(r);
            cipher.encrypt_block(&mut block);

            // A = MSB(64, B) ^ t, R[i] = LSB(64, B)
            a.copy_from_slice(&block[..8]);
            xor_step(&mut a, (n * j + i + 1) as u64);
            r.copy_from_slice(&block[8..]);
        }
    }
    block.as_mut_slice().zeroize();

    let mut wrapped = Vec::with_capacity(8 + registers.len());
    wrapped.extend_from_slice(&a);
    wrapped.extend_from_slice(&registers);
    Ok(wrapped)
}

/// Unwrap `ciphertext` under `kek`.
///
/// With a wrong KEK the integrity register will not match and
/// [`KeyWrapError::IntegrityCheck`] is returned.
pub fn unwrap_key(ciphertext: &[u8], kek: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>, KeyWrapError> {
    if ciphertext.len() % 8 != 0 || ciphertext.len() < 24 {
        return Err(KeyWrapError::InvalidCiphertextLength(ciphertext.len()));
    }

    let cipher = Aes256::new(kek.into());
    let n = ciphertext.len() / 8 - 1;
    let mut a = [0u8; 8];
    a.copy_from_slice(&ciphertext[..8]);
    let mut registers = Zeroizing::new(ciphertext[8..].to_vec());
    let mut block = aes::Block::default();

    for j in (0..6).rev() {
        for (i, r) in registers.chunks_exact_mut(8).enumerate().rev() {
            // B = AES-1(K, (A ^ t) | R[i])
            xor_step(&mut a, (n * j + i + 1) as u64);
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(r);
            cipher.decrypt_block(&mut block);

            a.copy_from_slice(&block[..8]);
            r.copy_from_slice(&block[8..]);
        }
    }
    block.as_mut_slice().zeroize();

    if bool::from(a.ct_eq(&IV_3394)) {
        Ok(registers)
    } else {
        Err(KeyWrapError::IntegrityCheck)
    }
}
