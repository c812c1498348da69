//! Vault: the unlocked identity key pair, held in memory.
//!
//! Unlocking opens the sealed key file with the user's passphrase. Locking
//! (explicitly or via the inactivity timer) drops the vault's reference to
//! the key pair. Operations already holding an `Arc` finish with it.
//!
//! Auto-lock: configurable inactivity timeout, 30 minutes by default.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};
use vanish_crypto::IdentityKeyPair;

use crate::error::StoreError;
use crate::keyfile::KeyFile;

pub const DEFAULT_AUTO_LOCK_SECS: u64 = 1800;

struct Unlocked {
    identity: Arc<IdentityKeyPair>,
    last_activity: Instant,
}

struct VaultInner {
    unlocked: Option<Unlocked>,
    auto_lock_secs: u64,
}

/// Thread-safe vault handle. Clone to share between session tasks.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<RwLock<VaultInner>>,
}

impl Vault {
    pub fn new() -> Self {
        Self::with_auto_lock(DEFAULT_AUTO_LOCK_SECS)
    }

    /// `0` disables auto-lock.
    pub fn with_auto_lock(seconds: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(VaultInner {
                unlocked: None,
                auto_lock_secs: seconds,
            })),
        }
    }

    /// Open `key_file` with `passphrase` and hold the identity.
    pub async fn unlock(&self, key_file: &KeyFile, passphrase: &[u8]) -> Result<(), StoreError> {
        let key_file = key_file.clone();
        let passphrase = zeroize::Zeroizing::new(passphrase.to_vec());
        let identity = tokio::task::spawn_blocking(move || key_file.open(&passphrase))
            .await
            .map_err(|e| StoreError::Unavailable(format!("unlock task failed: {e}")))??;
        self.unlock_with_identity(identity).await;
        Ok(())
    }

    /// Hold an already-loaded identity (fresh generation, platform keyring).
    pub async fn unlock_with_identity(&self, identity: IdentityKeyPair) {
        let mut guard = self.inner.write().await;
        guard.unlocked = Some(Unlocked {
            identity: Arc::new(identity),
            last_activity: Instant::now(),
        });
        info!("vault unlocked");
    }

    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        if guard.unlocked.take().is_some() {
            info!("vault locked");
        }
    }

    pub async fn is_locked(&self) -> bool {
        let expired = {
            let guard = self.inner.read().await;
            match guard.unlocked.as_ref() {
                None => return true,
                Some(u) => idle_expired(u, guard.auto_lock_secs),
            }
        };
        if expired {
            debug!("auto-lock timeout reached");
            self.lock().await;
        }
        expired
    }

    /// The unlocked identity. Touches the activity timer.
    pub async fn identity(&self) -> Result<Arc<IdentityKeyPair>, StoreError> {
        let mut guard = self.inner.write().await;
        let auto_lock_secs = guard.auto_lock_secs;
        let expired = match guard.unlocked.as_ref() {
            None => return Err(StoreError::VaultLocked),
            Some(u) => idle_expired(u, auto_lock_secs),
        };
        if expired {
            guard.unlocked = None;
            info!("vault auto-locked");
            return Err(StoreError::VaultLocked);
        }
        match guard.unlocked.as_mut() {
            Some(u) => {
                u.last_activity = Instant::now();
                Ok(Arc::clone(&u.identity))
            }
            None => Err(StoreError::VaultLocked),
        }
    }

    /// Swap in a new identity, keeping the vault unlocked. Used after a
    /// deliberate regeneration.
    pub async fn replace(&self, identity: IdentityKeyPair) -> Arc<IdentityKeyPair> {
        let identity = Arc::new(identity);
        let mut guard = self.inner.write().await;
        guard.unlocked = Some(Unlocked {
            identity: Arc::clone(&identity),
            last_activity: Instant::now(),
        });
        identity
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

fn idle_expired(u: &Unlocked, auto_lock_secs: u64) -> bool {
    auto_lock_secs > 0 && u.last_activity.elapsed() > Duration::from_secs(auto_lock_secs)
}
