//! Passphrase-sealed identity key file.
//!
//! ```json
//! { "version": 1, "user_id": "...", "public_key": "<base64 SPKI>",
//!   "sealed_private_key": "<base64 iv || AES-GCM(PKCS8)>",
//!   "salt": "<hex, 16 bytes>", "created_at": "<RFC 3339>" }
//! ```
//!
//! The sealing key is Argon2id(passphrase, salt). The private key is only
//! ever written in sealed form.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use vanish_crypto::cipher;
use vanish_crypto::encoding::{decode_b64, encode_b64};
use vanish_crypto::kdf::{self, SALT_LEN};
use vanish_crypto::{CryptoError, IdentityKeyPair, PublicIdentityKey};

use crate::error::StoreError;

pub const KEY_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u32,
    pub user_id: String,
    pub public_key: String,
    pub sealed_private_key: String,
    pub salt: String,
    pub created_at: DateTime<Utc>,
}

impl KeyFile {
    /// Seal `identity` under a key derived from `passphrase`. Runs Argon2id;
    /// call from a blocking context.
    pub fn seal(
        user_id: &str,
        identity: &IdentityKeyPair,
        passphrase: &[u8],
    ) -> Result<Self, StoreError> {
        let salt = kdf::generate_salt()?;
        let key = kdf::key_from_passphrase(passphrase, &salt)?;
        let der = identity.private_der()?;
        let sealed = cipher::seal(&key, &der)?;
        Ok(Self {
            version: KEY_FILE_VERSION,
            user_id: user_id.to_string(),
            public_key: identity.public_b64()?,
            sealed_private_key: encode_b64(&sealed),
            salt: hex::encode(salt),
            created_at: Utc::now(),
        })
    }

    /// Recover the identity. A wrong passphrase surfaces as
    /// `StoreError::Crypto(CryptoError::Decryption)`.
    pub fn open(&self, passphrase: &[u8]) -> Result<IdentityKeyPair, StoreError> {
        if self.version != KEY_FILE_VERSION {
            return Err(StoreError::KeyFileVersion(self.version));
        }
        let salt = self.salt_bytes()?;
        let key = kdf::key_from_passphrase(passphrase, &salt)?;
        let sealed = decode_b64(&self.sealed_private_key)?;
        let der = cipher::open(&key, &sealed)?;
        let identity = IdentityKeyPair::from_private_der(&der)?;
        if identity.public() != &self.public_identity()? {
            return Err(StoreError::KeyFileMismatch {
                user_id: self.user_id.clone(),
            });
        }
        Ok(identity)
    }

    pub fn public_identity(&self) -> Result<PublicIdentityKey, StoreError> {
        Ok(PublicIdentityKey::from_b64(&self.public_key)?)
    }

    pub fn fingerprint(&self) -> Result<String, StoreError> {
        Ok(self.public_identity()?.fingerprint()?)
    }

    fn salt_bytes(&self) -> Result<[u8; SALT_LEN], StoreError> {
        let raw = hex::decode(&self.salt)
            .map_err(|e| CryptoError::KeyFormat(format!("salt: {e}")))?;
        let salt: [u8; SALT_LEN] = raw.try_into().map_err(|v: Vec<u8>| {
            CryptoError::KeyFormat(format!("salt must be {SALT_LEN} bytes, got {}", v.len()))
        })?;
        Ok(salt)
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write as pretty JSON. On Unix the file is created owner-only.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;

        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        info!(user_id = %self.user_id, path = %path.display(), "key file written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn identity() -> &'static IdentityKeyPair {
        static PAIR: OnceLock<IdentityKeyPair> = OnceLock::new();
        PAIR.get_or_init(|| IdentityKeyPair::generate_with_bits(2048).unwrap())
    }

    #[test]
    fn seal_and_open() {
        let kf = KeyFile::seal("alice", identity(), b"hunter2").unwrap();
        assert_eq!(kf.version, KEY_FILE_VERSION);
        assert_eq!(kf.public_key, identity().public_b64().unwrap());
        let opened = kf.open(b"hunter2").unwrap();
        assert_eq!(opened.public(), identity().public());
    }

    #[test]
    fn wrong_passphrase_is_a_decryption_failure() {
        let kf = KeyFile::seal("alice", identity(), b"hunter2").unwrap();
        assert!(matches!(
            kf.open(b"hunter3"),
            Err(StoreError::Crypto(CryptoError::Decryption))
        ));
    }

    #[test]
    fn swapped_public_key_is_detected() {
        let mut kf = KeyFile::seal("alice", identity(), b"pw").unwrap();
        let other = IdentityKeyPair::generate_with_bits(2048).unwrap();
        kf.public_key = other.public_b64().unwrap();
        assert!(matches!(kf.open(b"pw"), Err(StoreError::KeyFileMismatch { .. })));
    }

    #[test]
    fn unknown_version_is_refused() {
        let mut kf = KeyFile::seal("alice", identity(), b"pw").unwrap();
        kf.version = 9;
        assert!(matches!(kf.open(b"pw"), Err(StoreError::KeyFileVersion(9))));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("alice.json");
        let kf = KeyFile::seal("alice", identity(), b"pw").unwrap();
        kf.save(&path).unwrap();
        let loaded = KeyFile::load(&path).unwrap();
        assert_eq!(loaded, kf);
        assert_eq!(loaded.fingerprint().unwrap(), identity().public().fingerprint().unwrap());

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(identity().private_b64().unwrap().as_str()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
