//! vanish_crypto: end-to-end encryption primitives for Vanish
//!
//! # Design principles
//! - NO custom crypto; RSA-OAEP and AES-256-GCM come from audited RustCrypto crates.
//! - Symmetric key material is zeroized on drop and never serialized raw.
//! - Unwrap failures stay distinguishable from authentication failures so
//!   callers can tell a rotated identity apart from a damaged packet.
//!
//! # Module layout
//! - `identity`: long-lived RSA-OAEP 4096 / SHA-512 identity key pairs (SPKI / PKCS8 export)
//! - `cipher`: per-message AES-256-GCM keys, content encryption, key wrapping
//! - `kdf`: Argon2id passphrase keys for sealing the private key at rest
//! - `hash`: SHA-512 fingerprints
//! - `encoding`: base64 helpers shared by the wire format
//! - `error`: unified error type

pub mod cipher;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;

mod random;

pub use cipher::{SealedContent, SymmetricKey};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, PublicIdentityKey};
