// src/config/mod.rs

//! Configuration loading and the configuration value object.

pub mod loader;
pub mod model;

pub use loader::{default_config_path, load_from_path, load_or_default};
pub use model::{AppConfig, LogConfig, PersistenceConfig, RunConfig, parse_iso_duration};
