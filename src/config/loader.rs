// src/config/loader.rs

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Deserialize TOML text into a `RawConfigFile`. No semantic validation.
pub fn parse_raw(contents: &str) -> Result<RawConfigFile> {
    Ok(toml::from_str(contents)?)
}

/// Read and deserialize a config file.
///
/// Relative `[storage].root` and `[storage].database` paths are resolved
/// against the directory holding the file, so neither the artifact tree nor
/// the database moves with the working directory.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let mut raw = parse_raw(&contents)?;

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        for target in [&mut raw.storage.root, &mut raw.storage.database] {
            if target.is_relative() {
                *target = dir.join(&*target);
            }
        }
    }

    Ok(raw)
}

/// Load a config file and validate it: stage references, stage graph cycles,
/// launcher pacing and cleaner batching.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw)?;
    debug!(
        path = ?path.as_ref(),
        stages = config.stage.len(),
        root = ?config.storage.root,
        database = ?config.storage.database,
        "loaded configuration"
    );
    Ok(config)
}
