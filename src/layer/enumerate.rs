//! Layer enumeration: which package containers sit under a layer root

use crate::cache::{CacheStats, ContainerCache};
use crate::error::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::Path;

/// Self/parent markers never name a container
pub(crate) fn is_dot_marker(name: &OsStr) -> bool {
    let bytes = name.as_encoded_bytes();
    !bytes.is_empty() && bytes.iter().all(|&b| b == b'.')
}

/// Read the container names directly under `root`, in directory order
pub fn read_containers(root: &Path) -> Result<Vec<OsString>> {
    let unavailable = |source| Error::LayerUnavailable {
        root: root.to_path_buf(),
        source,
    };

    let mut containers = Vec::new();
    for entry in fs::read_dir(root).map_err(unavailable)? {
        let entry = entry.map_err(unavailable)?;
        let name = entry.file_name();
        if !is_dot_marker(&name) {
            containers.push(name);
        }
    }

    Ok(containers)
}

/// Lists package containers of a layer, optionally through a cache
#[derive(Default)]
pub struct LayerEnumerator {
    cache: Option<ContainerCache>,
}

impl LayerEnumerator {
    /// Enumerator that re-reads the layer root on every call
    pub fn new() -> Self {
        Self { cache: None }
    }

    /// Enumerator backed by a container cache
    pub fn with_cache(cache: ContainerCache) -> Self {
        Self { cache: Some(cache) }
    }

    /// Cache counters, if caching is enabled
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(ContainerCache::stats)
    }

    /// Container names under `root`.
    ///
    /// Fails with `LayerUnavailable` when the root cannot be opened.
    pub fn enumerate_containers(&self, root: &Path) -> Result<Vec<OsString>> {
        match &self.cache {
            Some(cache) => cache.get_or_load(root, read_containers),
            None => read_containers(root),
        }
    }

    /// Drop any cached enumeration of `root`
    pub fn invalidate(&self, root: &Path) {
        if let Some(cache) = &self.cache {
            cache.invalidate(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dot_markers() {
        assert!(is_dot_marker(OsStr::new(".")));
        assert!(is_dot_marker(OsStr::new("..")));
        assert!(!is_dot_marker(OsStr::new(".hidden")));
        assert!(!is_dot_marker(OsStr::new("pkg")));
    }

    #[test]
    fn test_enumerate_containers() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("vim")).unwrap();
        fs::create_dir(dir.path().join("Unsorted-1")).unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();

        let enumerator = LayerEnumerator::new();
        let mut names = enumerator.enumerate_containers(dir.path()).unwrap();
        names.sort();
        assert_eq!(names, vec![".cache", "Unsorted-1", "vim"]);
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let dir = tempdir().unwrap();
        let err = LayerEnumerator::new()
            .enumerate_containers(&dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, Error::LayerUnavailable { .. }));
    }

    #[test]
    fn test_file_root_is_unavailable() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(read_containers(&file).is_err());
    }

    #[test]
    fn test_uncached_sees_new_containers() {
        let dir = tempdir().unwrap();
        let enumerator = LayerEnumerator::new();
        assert!(enumerator.enumerate_containers(dir.path()).unwrap().is_empty());

        fs::create_dir(dir.path().join("pkg")).unwrap();
        assert_eq!(enumerator.enumerate_containers(dir.path()).unwrap().len(), 1);
    }
}
