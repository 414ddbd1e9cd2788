//! Unit discovery.
//!
//! Walks a root directory and records every unit: a directory holding a
//! file whose basename matches the configured config filename. Cache,
//! boilerplate, and stack-internal directories never contain units and
//! are pruned from the walk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::options::DEFAULT_DOWNLOAD_DIR;

/// Directory names never descended into.
const SKIPPED_DIRS: &[&str] = &[
    DEFAULT_DOWNLOAD_DIR,
    ".terraform",
    ".terragrunt-stack",
    ".boilerplate",
    ".git",
];

/// One discovered unit, prior to any config parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUnit {
    /// Canonical unit directory.
    pub dir: PathBuf,
    /// Canonical config file path inside `dir`.
    pub config_path: PathBuf,
}

/// Find every unit under `root`, sorted by canonical path.
///
/// A file qualifies as a unit config iff its basename matches
/// `config_filename` and the file has content beyond whitespace.
pub fn discover_units(root: &Path, config_filename: &str) -> Result<Vec<DiscoveredUnit>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("discovery root does not exist: {}", root.display()))?;

    let mut units = Vec::new();

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !SKIPPED_DIRS.contains(&name.as_ref())
        });

    for entry in walker {
        let entry = entry.context("failed to walk discovery root")?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy() != config_filename {
            continue;
        }

        let content = std::fs::read_to_string(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        if content.trim().is_empty() {
            tracing::debug!(path = %entry.path().display(), "skipping empty config file");
            continue;
        }

        let config_path = entry
            .path()
            .canonicalize()
            .with_context(|| format!("failed to canonicalize {}", entry.path().display()))?;
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.clone());

        units.push(DiscoveredUnit { dir, config_path });
    }

    units.sort_by(|a, b| a.dir.cmp(&b.dir));
    units.dedup();
    Ok(units)
}
