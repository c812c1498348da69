//! Identity key management
//!
//! Each user owns one long-lived RSA-OAEP key pair: 4096-bit modulus,
//! public exponent 65537, SHA-512 as both the OAEP digest and the MGF1 hash.
//! The public half is distributed as base64 SPKI DER through the directory
//! service; the private half only leaves this process as base64 PKCS8 DER so
//! it can be sealed at rest (see `vanish_store::keyfile`).
//!
//! Regeneration policy
//! -------------------
//! Replacing a key pair is destructive: every packet whose symmetric key was
//! wrapped for the old public key becomes permanently undecryptable on this
//! device. Outgoing capability is unaffected. The new public key must be
//! published to the directory before it is trusted for incoming traffic;
//! that ordering is enforced by `vanish_session::identity`.

use std::fmt;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::encoding::{decode_b64, encode_b64};
use crate::error::CryptoError;
use crate::hash;
use crate::random;

pub const DEFAULT_MODULUS_BITS: usize = 4096;
pub const MIN_MODULUS_BITS: usize = 2048;

/// Values that leak out of loosely typed storage layers in place of a key.
const SENTINEL_VALUES: &[&str] = &["undefined", "null"];

// ── Public key ────────────────────────────────────────────────────────────────

/// RSA-OAEP public key of a conversation participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentityKey(RsaPublicKey);

impl PublicIdentityKey {
    pub fn to_b64(&self) -> Result<String, CryptoError> {
        export_public(self)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        import_public(s)
    }

    pub fn modulus_bits(&self) -> usize {
        self.0.size() * 8
    }

    /// SHA-512 of the SPKI encoding, base64. Stable across export/import.
    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        let der = self.spki_der()?;
        Ok(hash::digest_b64(&der))
    }

    fn spki_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = self
            .0
            .to_public_key_der()
            .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// RSA-OAEP(SHA-512) encryption of a short secret under this key.
    pub(crate) fn encrypt_oaep(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.0
            .encrypt(&mut OsRng, Oaep::new::<Sha512>(), data)
            .map_err(|e| match e {
                rsa::Error::MessageTooLong => CryptoError::KeyFormat(format!(
                    "{}-bit key cannot wrap {} bytes",
                    self.modulus_bits(),
                    data.len()
                )),
                other => CryptoError::Environment(other.to_string()),
            })
    }
}

// ── Key pair ──────────────────────────────────────────────────────────────────

/// Long-lived identity key pair. The private key never leaves the owning
/// process except through [`export_private`]; `RsaPrivateKey` zeroizes its
/// limbs on drop.
#[derive(Clone)]
pub struct IdentityKeyPair {
    public: PublicIdentityKey,
    private: RsaPrivateKey,
}

impl IdentityKeyPair {
    /// Fresh RSA-OAEP 4096 / SHA-512 pair.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(DEFAULT_MODULUS_BITS)
    }

    /// Smaller moduli are for tests and constrained devices; anything below
    /// 2048 bits is refused.
    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_MODULUS_BITS {
            return Err(CryptoError::KeyGeneration(format!(
                "modulus must be at least {MIN_MODULUS_BITS} bits, got {bits}"
            )));
        }
        // Check the OS source first so an unusable environment is reported as
        // such rather than as a generic generation failure.
        random::fill(&mut [0u8; 16])?;

        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = PublicIdentityKey(private.to_public_key());
        Self { public, private }
    }

    pub fn public(&self) -> &PublicIdentityKey {
        &self.public
    }

    pub fn public_b64(&self) -> Result<String, CryptoError> {
        export_public(&self.public)
    }

    pub fn private_b64(&self) -> Result<Zeroizing<String>, CryptoError> {
        export_private(self)
    }

    pub fn from_private_b64(s: &str) -> Result<Self, CryptoError> {
        import_private(s)
    }

    /// Raw PKCS8 DER, for sealing into a key file.
    pub fn private_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    pub fn from_private_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    pub(crate) fn decrypt_oaep(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, rsa::Error> {
        self.private
            .decrypt(Oaep::new::<Sha512>(), data)
            .map(Zeroizing::new)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("modulus_bits", &self.public.modulus_bits())
            .finish_non_exhaustive()
    }
}

// ── Export / import ───────────────────────────────────────────────────────────

/// Base64 SPKI DER.
pub fn export_public(key: &PublicIdentityKey) -> Result<String, CryptoError> {
    Ok(encode_b64(&key.spki_der()?))
}

/// Base64 PKCS8 DER. Only for local persistence.
pub fn export_private(pair: &IdentityKeyPair) -> Result<Zeroizing<String>, CryptoError> {
    let der = pair.private_der()?;
    Ok(Zeroizing::new(encode_b64(&der)))
}

/// Base64 SPKI DER. Keys under [`MIN_MODULUS_BITS`] are refused.
pub fn import_public(b64: &str) -> Result<PublicIdentityKey, CryptoError> {
    let der = decode_key_b64(b64)?;
    let key = RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
    let key = PublicIdentityKey(key);
    if key.modulus_bits() < MIN_MODULUS_BITS {
        return Err(CryptoError::KeyFormat(format!(
            "modulus must be at least {MIN_MODULUS_BITS} bits, got {}",
            key.modulus_bits()
        )));
    }
    Ok(key)
}

pub fn import_private(b64: &str) -> Result<IdentityKeyPair, CryptoError> {
    let der = Zeroizing::new(decode_key_b64(b64)?);
    IdentityKeyPair::from_private_der(&der)
}

fn decode_key_b64(b64: &str) -> Result<Vec<u8>, CryptoError> {
    let trimmed = b64.trim();
    if trimmed.is_empty() {
        return Err(CryptoError::KeyFormat("key is empty".into()));
    }
    if SENTINEL_VALUES.contains(&trimmed) {
        return Err(CryptoError::KeyFormat(format!("placeholder value {trimmed:?} is not a key")));
    }
    let der = decode_b64(trimmed).map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
    if der.is_empty() {
        return Err(CryptoError::KeyFormat("key decodes to zero bytes".into()));
    }
    Ok(der)
}

#[cfg(test)]
pub(crate) fn test_pair() -> &'static IdentityKeyPair {
    use std::sync::OnceLock;
    static PAIR: OnceLock<IdentityKeyPair> = OnceLock::new();
    PAIR.get_or_init(|| IdentityKeyPair::generate_with_bits(MIN_MODULUS_BITS).unwrap())
}
