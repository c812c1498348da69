//! CLI settings: `settings.json` in the data directory, then environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;

pub const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CliSettings {
    pub db_path: Option<PathBuf>,
    pub purge_interval_secs: Option<u64>,
    pub key_dir: Option<PathBuf>,
}

impl CliSettings {
    /// Settings file (missing is fine), then `VANISH_DB_PATH`.
    pub fn load() -> Result<Self> {
        let mut settings = Self::from_file(&paths::settings_path()?)?;
        if let Ok(db) = std::env::var("VANISH_DB_PATH") {
            if !db.is_empty() {
                settings.db_path = Some(PathBuf::from(db));
            }
        }
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("invalid settings file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(p) => Ok(p.clone()),
            None => paths::default_db_path(),
        }
    }

    pub fn key_dir(&self) -> Result<PathBuf> {
        match &self.key_dir {
            Some(p) => Ok(p.clone()),
            None => paths::default_key_dir(),
        }
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(
            self.purge_interval_secs
                .unwrap_or(DEFAULT_PURGE_INTERVAL_SECS)
                .max(1),
        )
    }
}
