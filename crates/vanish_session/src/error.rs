use thiserror::Error;
use vanish_crypto::CryptoError;
use vanish_proto::{LifecycleError, PacketError};
use vanish_store::StoreError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer never published a public key, so nothing can be wrapped for them.
    #[error("Recipient {0} has no published encryption key")]
    RecipientKeyUnavailable(String),

    #[error("Local identity key pair is not loaded")]
    LocalIdentityUninitialized,

    #[error("Message has no text and no media")]
    EmptyMessage,

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Session is closed")]
    Closed,

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VaultLocked => SessionError::LocalIdentityUninitialized,
            other => SessionError::Store(other),
        }
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(e: tokio::task::JoinError) -> Self {
        SessionError::Task(e.to_string())
    }
}
