//! Per-directory mutual exclusion.
//!
//! Code generation and hook execution may target the same download
//! directory from different workers. A lazily materialized map of
//! per-path mutexes serializes them without one global lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A map from path to mutex, materialized on first use.
#[derive(Debug, Default, Clone)]
pub struct PathLocks {
    inner: Arc<Mutex<BTreeMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("path lock map poisoned");
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock for `path`.
    pub fn with_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let mutex = self.mutex_for(path);
        let _guard = mutex.lock().expect("path lock poisoned");
        f()
    }
}
