//! Identity regeneration and repair.
//!
//! Regeneration is destructive: every packet wrapped for the old public key
//! becomes undecryptable on this device. It therefore takes an explicit
//! [`RegenerationConsent`] and publishes the new public key to the directory
//! before the vault starts using the new private key.

use std::sync::Arc;

use tracing::{info, warn};
use vanish_crypto::identity::DEFAULT_MODULUS_BITS;
use vanish_crypto::IdentityKeyPair;
use vanish_store::{Directory, Vault};

use crate::error::SessionError;

/// Acknowledgement that the caller has been told what regeneration costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerationConsent {
    PastMessagesBecomeUnreadable,
}

pub struct IdentityService {
    user_id: String,
    vault: Vault,
    directory: Arc<dyn Directory>,
    modulus_bits: usize,
}

impl IdentityService {
    pub fn new(user_id: impl Into<String>, vault: Vault, directory: Arc<dyn Directory>) -> Self {
        Self {
            user_id: user_id.into(),
            vault,
            directory,
            modulus_bits: DEFAULT_MODULUS_BITS,
        }
    }

    /// Smaller keys for tests and constrained devices (minimum 2048).
    pub fn with_modulus_bits(mut self, bits: usize) -> Self {
        self.modulus_bits = bits;
        self
    }

    pub async fn current(&self) -> Result<Arc<IdentityKeyPair>, SessionError> {
        Ok(self.vault.identity().await?)
    }

    /// Republish the locally held public key. The remedy for a
    /// `SignalMismatch`: peers fetch keys fresh on every send, so their next
    /// message is wrapped for the key this device can actually open.
    pub async fn repair(&self) -> Result<String, SessionError> {
        let identity = self.current().await?;
        let public = identity.public_b64()?;
        self.directory.publish_public_key(&self.user_id, &public).await?;
        info!(user_id = %self.user_id, "identity public key republished");
        Ok(public)
    }

    /// Generate, publish, then install a new key pair. Returns it so the
    /// caller can persist it (see `vanish_store::KeyFile`).
    ///
    /// If publishing fails the vault keeps the old identity.
    pub async fn regenerate(
        &self,
        consent: RegenerationConsent,
    ) -> Result<Arc<IdentityKeyPair>, SessionError> {
        let RegenerationConsent::PastMessagesBecomeUnreadable = consent;

        let bits = self.modulus_bits;
        let fresh = tokio::task::spawn_blocking(move || IdentityKeyPair::generate_with_bits(bits))
            .await??;
        let public = fresh.public_b64()?;
        self.directory.publish_public_key(&self.user_id, &public).await?;
        let installed = self.vault.replace(fresh).await;
        warn!(
            user_id = %self.user_id,
            "identity regenerated; previously received messages are unreadable on this device"
        );
        Ok(installed)
    }
}
