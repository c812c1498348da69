use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "vanish";
pub const APP_NAME: &str = "vanish";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_dir) = std::env::var("VANISH_DATA_DIR") {
        if !override_dir.is_empty() {
            return Ok(PathBuf::from(override_dir));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("settings.json"))
}

pub fn default_db_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("messages.db"))
}

pub fn default_key_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("keys"))
}
