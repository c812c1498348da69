//! Key derivation functions
//!
//! `key_from_passphrase`: Argon2id, derives the 32-byte AES-256-GCM key that
//!   seals the identity private key in the local key file.

use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

use crate::cipher::SymmetricKey;
use crate::error::CryptoError;
use crate::random;

pub const SALT_LEN: usize = 16;

/// Argon2id parameters, tuned for interactive unlock on desktop hardware.
fn argon2_params() -> Result<Params, CryptoError> {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a sealing key from a passphrase + 16-byte salt.
/// The salt is stored next to the sealed key (not secret).
pub fn key_from_passphrase(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
) -> Result<SymmetricKey, CryptoError> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params()?);
    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase, salt, &mut output[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    SymmetricKey::from_bytes(&output[..])
}

/// Fresh random salt for a new key file.
pub fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    random::fill(&mut salt)?;
    Ok(salt)
}
