//! Path resolution within one layer

use super::LayerEnumerator;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Find the first container of `root` that physically holds `relative`.
///
/// Containers are tried in enumeration order and the search stops at the
/// first hit; a path present in several containers is not reported. An
/// unavailable layer resolves to `NotFound`.
pub fn resolve(enumerator: &LayerEnumerator, root: &Path, relative: &Path) -> Result<PathBuf> {
    let containers = enumerator
        .enumerate_containers(root)
        .map_err(|_| Error::NotFound(relative.to_path_buf()))?;

    for container in containers {
        let candidate = root.join(container).join(relative);
        // lstat: a dangling symlink still exists as far as the namespace cares
        if fs::symlink_metadata(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    Err(Error::NotFound(relative.to_path_buf()))
}
