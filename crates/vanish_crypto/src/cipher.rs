//! Hybrid message encryption
//!
//! One AES-256-GCM key per message. The body is encrypted once; the raw key
//! is then wrapped separately for every recipient with RSA-OAEP(SHA-512).
//! IV: 12 bytes, fresh from the OS CSPRNG on every call. Tag: 128 bits,
//! appended to the ciphertext (`ciphertext || tag`, the AEAD convention).
//!
//! Local sealing (key files) uses the same cipher with the IV prepended:
//!   [ iv (12 bytes) | ciphertext + tag ]

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::encoding::{decode_b64, encode_b64};
use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, PublicIdentityKey};
use crate::random;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Ephemeral per-message AES-256-GCM key. Lives for one encrypt or decrypt.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        random::fill(&mut key)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::KeyFormat(format!(
                "symmetric key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Output of [`encrypt_content`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedContent {
    /// `ciphertext || tag`
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
}

pub fn generate_symmetric_key() -> Result<SymmetricKey, CryptoError> {
    SymmetricKey::generate()
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
pub fn encrypt_content(plaintext: &[u8], key: &SymmetricKey) -> Result<SealedContent, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    random::fill(&mut iv)?;
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(SealedContent { ciphertext, iv })
}

/// Authenticated decryption. Any tampering, wrong key or wrong IV yields
/// `CryptoError::Decryption`; no partial plaintext is ever returned.
pub fn decrypt_content(
    ciphertext: &[u8],
    iv: &[u8],
    key: &SymmetricKey,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if iv.len() != IV_LEN || ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    key.cipher()
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Decryption)
}

/// Wrap the raw key bytes for one recipient. Returns base64 RSA-OAEP ciphertext.
pub fn wrap_key_for_recipient(
    key: &SymmetricKey,
    recipient: &PublicIdentityKey,
) -> Result<String, CryptoError> {
    let wrapped = recipient.encrypt_oaep(key.as_bytes())?;
    Ok(encode_b64(&wrapped))
}

/// Recover a wrapped key with the local private key.
///
/// Every failure here is `CryptoError::KeyUnwrap`: empty input, bad base64,
/// OAEP failure, or a payload that is not a 256-bit key. In practice this
/// means the sender wrapped for a public key this device no longer holds.
pub fn unwrap_key(wrapped_b64: &str, own: &IdentityKeyPair) -> Result<SymmetricKey, CryptoError> {
    if wrapped_b64.trim().is_empty() {
        return Err(CryptoError::KeyUnwrap("wrapped key is empty".into()));
    }
    let wrapped = decode_b64(wrapped_b64).map_err(|e| CryptoError::KeyUnwrap(e.to_string()))?;
    if wrapped.is_empty() {
        return Err(CryptoError::KeyUnwrap("wrapped key decodes to zero bytes".into()));
    }
    let raw = own
        .decrypt_oaep(&wrapped)
        .map_err(|e| CryptoError::KeyUnwrap(e.to_string()))?;
    SymmetricKey::from_bytes(&raw).map_err(|e| CryptoError::KeyUnwrap(e.to_string()))
}

/// Seal local data at rest: `iv || ciphertext+tag`.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sealed = encrypt_content(plaintext, key)?;
    let mut out = Vec::with_capacity(IV_LEN + sealed.ciphertext.len());
    out.extend_from_slice(&sealed.iv);
    out.extend_from_slice(&sealed.ciphertext);
    Ok(out)
}

/// Open data produced by [`seal`].
pub fn open(key: &SymmetricKey, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let (iv, ct) = data.split_at(IV_LEN);
    decrypt_content(ct, iv, key)
}
