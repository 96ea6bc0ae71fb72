// src/fs/mod.rs

//! Filesystem access for artifacts.
//!
//! - [`layout`] derives an artifact's path from its product metadata.
//! - [`mock`] provides an in-memory [`FileSystem`] for tests.

use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

pub mod layout;
pub mod mock;

pub use layout::ArtifactLayout;

/// Abstract filesystem interface.
pub trait FileSystem: Send + Sync + Debug {
    /// Write a file, creating parent directories as needed.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    /// Remove a file. Returns `false` if it did not exist.
    fn remove_file(&self, path: &Path) -> Result<bool>;
    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;

    /// Return a list of entries in a directory.
    /// Returns full paths.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        fs::write(path, contents).with_context(|| format!("writing to file {:?}", path))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("reading file {:?}", path))
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("removing file {:?}", path)),
        }
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).with_context(|| format!("removing dir {:?}", path))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("reading dir {:?}", path))? {
            let entry = entry?;
            entries.push(entry.path());
        }
        Ok(entries)
    }
}

/// Remove `start` and each of its ancestors while they are empty directories,
/// stopping at `root` (which is never removed). Returns the removed
/// directories, deepest first.
///
/// Paths outside `root` are left alone.
pub fn prune_empty_dirs(fs: &dyn FileSystem, start: &Path, root: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut current = start.to_path_buf();

    while current != root && current.starts_with(root) {
        if !fs.is_dir(&current) || !fs.read_dir(&current)?.is_empty() {
            break;
        }
        fs.remove_dir(&current)?;
        debug!(dir = ?current, "removed empty artifact directory");
        removed.push(current.clone());

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    Ok(removed)
}
