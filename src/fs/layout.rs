// src/fs/layout.rs

//! Deterministic artifact paths.
//!
//! ```text
//! <root>/<stage>/<type>/<source>/<YYYY>/<MM>/<DD>/<stage>_<type>_<source>_<YYYYMMDDTHHMMSSnnnnnnnnn>_v<version>.dat
//! ```
//!
//! Key components are percent-escaped so that they contain no `_`, `.`,
//! `/` or `\`, and the timestamp carries nanoseconds. Distinct product keys
//! therefore never share a file name. Sidecar files share the artifact's stem
//! and differ only in extension.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use super::FileSystem;
use crate::model::ProductKey;

/// Extension of the primary artifact file.
pub const ARTIFACT_EXTENSION: &str = "dat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File stem shared by the artifact and its sidecars.
    pub fn stem(&self, key: &ProductKey) -> String {
        format!(
            "{}_{}_{}_{}_v{}",
            component(&key.stage),
            component(&key.product_type),
            component(&key.source),
            key.observation_time.format("%Y%m%dT%H%M%S%9f"),
            key.version
        )
    }

    /// Name of the primary artifact file.
    pub fn file_name(&self, key: &ProductKey) -> String {
        format!("{}.{ARTIFACT_EXTENSION}", self.stem(key))
    }

    pub fn dir_for(&self, key: &ProductKey) -> PathBuf {
        self.root
            .join(component(&key.stage))
            .join(component(&key.product_type))
            .join(component(&key.source))
            .join(key.observation_time.format("%Y").to_string())
            .join(key.observation_time.format("%m").to_string())
            .join(key.observation_time.format("%d").to_string())
    }

    pub fn path_for(&self, key: &ProductKey) -> PathBuf {
        self.dir_for(key).join(self.file_name(key))
    }

    pub fn sidecar_path(&self, key: &ProductKey, extension: &str) -> PathBuf {
        self.dir_for(key)
            .join(format!("{}.{}", self.stem(key), extension))
    }

    /// Delete the artifact and its sidecars. Returns the removed files.
    pub fn remove_artifact(&self, fs: &dyn FileSystem, key: &ProductKey) -> Result<Vec<PathBuf>> {
        let dir = self.dir_for(key);
        if !fs.is_dir(&dir) {
            return Ok(Vec::new());
        }

        let stem = self.stem(key);
        let mut removed = Vec::new();
        for entry in fs.read_dir(&dir)? {
            let same_stem = entry
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s == stem);
            if same_stem && fs.remove_file(&entry)? {
                debug!(file = ?entry, "removed artifact file");
                removed.push(entry);
            }
        }
        Ok(removed)
    }
}

/// Escape a key field into a flat, separator-free path component.
fn component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            '_' => out.push_str("%5F"),
            other => out.push(other),
        }
    }
    out
}
