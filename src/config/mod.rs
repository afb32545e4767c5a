mod types;

pub use types::*;

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".gfs_sql_backup"))
        .unwrap_or_else(|| PathBuf::from(".gfs_sql_backup"))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn default_catalog_path() -> PathBuf {
    config_dir().join("catalog.json")
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!("Config file not found at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    info!("Loading configuration from {:?}", path);
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            info!("Creating config directory: {:?}", parent);
            fs::create_dir_all(parent)?;
        }
    }

    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    info!("Configuration saved to {:?}", path);
    Ok(())
}
