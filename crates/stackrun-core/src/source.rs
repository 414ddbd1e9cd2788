//! Source resolution.
//!
//! A unit that declares `terraform { source = ... }` runs from a local
//! working copy of that source, materialized under a content-addressed
//! directory inside the download cache. The fetcher itself is a
//! collaborator; the default implementation handles local paths and
//! `file://` URLs and preserves symlinks.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};

use crate::locks::PathLocks;

/// Materializes a source URL into a destination directory.
pub trait Fetcher: Sync {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Fetcher for local directories and `file://` URLs.
pub struct LocalFetcher;

impl Fetcher for LocalFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let source = Path::new(path);
        if !source.is_dir() {
            bail!("source is not a local directory: {url}");
        }
        copy_tree(source, dest)
    }
}

/// Apply `source_map` prefix substitutions to `url`. The longest
/// matching prefix wins so overlapping map entries stay predictable.
pub fn apply_source_map(map: &std::collections::BTreeMap<String, String>, url: &str) -> String {
    let mut best: Option<(&str, &str)> = None;
    for (prefix, replacement) in map {
        if url.starts_with(prefix.as_str()) {
            match best {
                Some((current, _)) if current.len() >= prefix.len() => {}
                _ => best = Some((prefix, replacement)),
            }
        }
    }
    match best {
        Some((prefix, replacement)) => format!("{replacement}{}", &url[prefix.len()..]),
        None => url.to_string(),
    }
}

/// Cache directory for `url` under `download_dir`: one directory per
/// distinct final URL, keyed by its SHA-256.
pub fn cache_dir_for(download_dir: &Path, url: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    download_dir.join(&digest[..24])
}

/// Resolve `source_url` into a ready working directory.
///
/// Cache reuse is the default; `source_update` clears the entry first.
/// Concurrent calls for the same cache key deduplicate through the
/// per-path lock map: one caller fetches while the rest wait.
pub fn resolve(
    source_url: &str,
    download_dir: &Path,
    source_update: bool,
    fetcher: &dyn Fetcher,
    locks: &PathLocks,
) -> Result<PathBuf> {
    let dir = cache_dir_for(download_dir, source_url);

    locks.with_lock(&dir, || {
        let populated = dir.is_dir() && dir.read_dir().map(|mut i| i.next().is_some()).unwrap_or(false);
        if populated && !source_update {
            tracing::debug!(url = source_url, dir = %dir.display(), "reusing cached source");
            return Ok(dir.clone());
        }

        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clear cache dir {}", dir.display()))?;
        }
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;

        fetcher
            .fetch(source_url, &dir)
            .with_context(|| format!("failed to fetch source {source_url}"))?;
        Ok(dir.clone())
    })
}

/// Recursively copy `source` into `dest`, preserving symbolic links.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir yields children of its root");
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .with_context(|| format!("failed to read link {}", entry.path().display()))?;
            make_symlink(&link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target)
        .with_context(|| format!("failed to create symlink {}", target.display()))
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    // Symlink creation needs privileges on this platform; fall back to
    // copying the link target when it resolves.
    std::fs::copy(link, target)
        .map(|_| ())
        .with_context(|| format!("failed to copy link target {}", link.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl Fetcher for CountingFetcher {
        fn fetch(&self, _url: &str, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(dest.join("main.tf"), "# module\n")?;
            Ok(())
        }
    }

    #[test]
    fn source_map_substitutes_longest_prefix() {
        let mut map = BTreeMap::new();
        map.insert(
            "git::https://example.com".to_string(),
            "/local/mirror".to_string(),
        );
        map.insert(
            "git::https://example.com/infra".to_string(),
            "/local/infra".to_string(),
        );

        assert_eq!(
            apply_source_map(&map, "git::https://example.com/infra//vpc"),
            "/local/infra//vpc"
        );
        assert_eq!(
            apply_source_map(&map, "git::https://example.com/other//db"),
            "/local/mirror/other//db"
        );
        assert_eq!(apply_source_map(&map, "git::https://unrelated.io//m"), "git::https://unrelated.io//m");
    }

    #[test]
    fn cache_dir_is_stable_per_url() {
        let base = Path::new("/cache");
        let a1 = cache_dir_for(base, "git::https://example.com//vpc");
        let a2 = cache_dir_for(base, "git::https://example.com//vpc");
        let b = cache_dir_for(base, "git::https://example.com//db");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.starts_with(base));
    }

    #[test]
    fn resolve_fetches_once_then_reuses() {
        let td = tempdir().expect("tempdir");
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
        };
        let locks = PathLocks::new();

        let first = resolve("src://unit", td.path(), false, &fetcher, &locks).expect("resolve");
        let second = resolve("src://unit", td.path(), false, &fetcher, &locks).expect("resolve");

        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(first.join("main.tf").is_file());
    }

    #[test]
    fn source_update_refetches() {
        let td = tempdir().expect("tempdir");
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
        };
        let locks = PathLocks::new();

        let dir = resolve("src://unit", td.path(), false, &fetcher, &locks).expect("resolve");
        std::fs::write(dir.join("stale.txt"), "old").expect("write");

        let dir = resolve("src://unit", td.path(), true, &fetcher, &locks).expect("resolve");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(!dir.join("stale.txt").exists());
        assert!(dir.join("main.tf").is_file());
    }

    #[test]
    fn concurrent_resolves_deduplicate() {
        let td = tempdir().expect("tempdir");
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
        };
        let locks = PathLocks::new();

        std::thread::scope(|s| {
            for _ in 0..6 {
                let locks = locks.clone();
                let fetcher = &fetcher;
                let base = td.path();
                s.spawn(move || {
                    resolve("src://same", base, false, fetcher, &locks).expect("resolve");
                });
            }
        });

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn local_fetcher_copies_tree_with_symlinks() {
        let td = tempdir().expect("tempdir");
        let src = td.path().join("module");
        std::fs::create_dir_all(src.join("sub")).expect("mkdir");
        std::fs::write(src.join("main.tf"), "resource {}\n").expect("write");
        std::fs::write(src.join("sub").join("vars.tf"), "variable {}\n").expect("write");
        #[cfg(unix)]
        std::os::unix::fs::symlink("main.tf", src.join("link.tf")).expect("symlink");

        let dest = td.path().join("dest");
        std::fs::create_dir_all(&dest).expect("mkdir");
        LocalFetcher
            .fetch(&format!("file://{}", src.display()), &dest)
            .expect("fetch");

        assert!(dest.join("main.tf").is_file());
        assert!(dest.join("sub").join("vars.tf").is_file());
        #[cfg(unix)]
        {
            let meta = std::fs::symlink_metadata(dest.join("link.tf")).expect("meta");
            assert!(meta.file_type().is_symlink());
        }
    }

    #[test]
    fn local_fetcher_rejects_missing_dir() {
        let td = tempdir().expect("tempdir");
        let err = LocalFetcher
            .fetch("/no/such/module/dir", td.path())
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("not a local directory"));
    }
}
