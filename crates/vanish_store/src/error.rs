use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Vault is locked, unlock the identity key file first")]
    VaultLocked,

    #[error("Crypto error: {0}")]
    Crypto(#[from] vanish_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Stored row is invalid: {0}")]
    InvalidRow(String),

    /// The public key in a key file does not belong to its sealed private key.
    #[error("Key file for {user_id} is inconsistent: public key does not match private key")]
    KeyFileMismatch { user_id: String },

    #[error("Unsupported key file version {0}")]
    KeyFileVersion(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
