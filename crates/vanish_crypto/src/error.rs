use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The OS random source or a primitive it backs is unusable.
    #[error("Secure crypto environment unavailable: {0}")]
    Environment(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Malformed key material: {0}")]
    KeyFormat(String),

    /// The wrapped symmetric key could not be recovered with the local
    /// private key. Almost always a rotated or stale identity key.
    #[error("Wrapped key could not be unwrapped with the local identity: {0}")]
    KeyUnwrap(String),

    #[error("AES-GCM encryption failed")]
    Encryption,

    #[error("AES-GCM decryption failed (authentication tag mismatch, wrong key or iv)")]
    Decryption,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
