//! Session settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vanish_proto::LifecyclePolicy;
use vanish_store::vault::DEFAULT_AUTO_LOCK_SECS;
use vanish_store::Vault;

use crate::error::SessionError;

pub const DEFAULT_SWEEP_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Period of the client-side expiry sweep.
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// Remembered auto-delete choice. Callers still pass a policy to `send`
    /// explicitly; this only seeds their default.
    #[serde(default)]
    pub default_policy: LifecyclePolicy,
    /// Vault inactivity timeout. 0 disables auto-lock.
    #[serde(default = "default_auto_lock_secs")]
    pub auto_lock_secs: u64,
}

fn default_sweep_secs() -> u64 {
    DEFAULT_SWEEP_SECS
}

fn default_auto_lock_secs() -> u64 {
    DEFAULT_AUTO_LOCK_SECS
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_SECS,
            default_policy: LifecyclePolicy::None,
            auto_lock_secs: DEFAULT_AUTO_LOCK_SECS,
        }
    }
}

impl SessionSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// A locked vault with this configuration's auto-lock timeout.
    pub fn vault(&self) -> Vault {
        Vault::with_auto_lock(self.auto_lock_secs)
    }

    /// Read settings from a JSON file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| SessionError::Store(vanish_store::StoreError::Serialisation(e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(SessionError::Store(vanish_store::StoreError::Io(e))),
        }
    }
}
