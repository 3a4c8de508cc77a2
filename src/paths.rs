//! Centralized application directory paths.
//!
//! Single source of truth for every filesystem path the crate touches.
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! # Environment Overrides
//!
//! - `KINDRED_DATA_DIR` — overrides [`data_dir`]
//! - `KINDRED_CONFIG_DIR` — overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Holds the checkpoint file. Resolves to `dirs::data_dir()/kindred/` by
/// default; override with `KINDRED_DATA_DIR`.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("KINDRED_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("kindred"))
        .unwrap_or_else(|| PathBuf::from("/tmp/kindred-data"))
}

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/kindred/` by default; override with
/// `KINDRED_CONFIG_DIR`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("KINDRED_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("kindred"))
        .unwrap_or_else(|| PathBuf::from("/tmp/kindred-config"))
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Checkpoint file path (`data_dir()/checkpoint.json`).
#[must_use]
pub fn checkpoint_file() -> PathBuf {
    data_dir().join("checkpoint.json")
}
