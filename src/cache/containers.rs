//! Container enumeration cache
//!
//! Entries are keyed by layer root and validated against the root's
//! modification time, which changes whenever a container is added,
//! removed or renamed.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

struct CachedContainers {
    modified: SystemTime,
    names: Vec<OsString>,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub roots: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Memoized container lists per layer root
#[derive(Default)]
pub struct ContainerCache {
    entries: DashMap<PathBuf, CachedContainers>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContainerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached list for `root`, reloading it with `load` when the
    /// root changed since it was cached
    pub fn get_or_load<F>(&self, root: &Path, load: F) -> Result<Vec<OsString>>
    where
        F: FnOnce(&Path) -> Result<Vec<OsString>>,
    {
        let modified = std::fs::metadata(root)
            .and_then(|m| m.modified())
            .map_err(|source| {
                self.entries.remove(root);
                Error::LayerUnavailable {
                    root: root.to_path_buf(),
                    source,
                }
            })?;

        if let Some(cached) = self.entries.get(root) {
            if cached.modified == modified {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.names.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let names = load(root)?;
        self.entries.insert(
            root.to_path_buf(),
            CachedContainers {
                modified,
                names: names.clone(),
            },
        );
        Ok(names)
    }

    /// Forget the cached list for `root`
    pub fn invalidate(&self, root: &Path) {
        self.entries.remove(root);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            roots: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
