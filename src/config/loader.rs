// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::AppConfig;
use crate::errors::Result;

/// Load a configuration file from a given path.
///
/// This only performs TOML deserialization; defaults are applied by
/// `serde` + `Default` impls on the model types.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Load the configuration, falling back to defaults when the file does
/// not exist.
///
/// This is the recommended entry point for the rest of the application:
/// a host without a config file behaves like one with an empty file.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(AppConfig::default());
    }
    load_from_path(path)
}

/// Default config path: `jobmon.toml` in the current working directory.
///
/// This function exists so a later version can respect an env var or
/// XDG-style lookup without touching call sites.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("jobmon.toml")
}
