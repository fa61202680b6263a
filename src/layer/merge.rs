//! Directory listing across the containers of a layer

use super::{enumerate::is_dot_marker, LayerEnumerator};
use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use tracing::warn;

/// One entry of a merged listing
#[derive(Debug, Clone)]
pub struct ListingEntry {
    /// Name shown to the caller
    pub name: OsString,
    /// Physical path backing the entry
    pub physical_path: PathBuf,
    /// lstat snapshot taken while listing
    pub metadata: Metadata,
}

/// List virtual directory `dir` in every container of the layer at `root`.
///
/// Entries are concatenated in container order without deduplication. A
/// container lacking `dir` contributes nothing, but an entry whose metadata
/// cannot be read fails the whole listing.
pub fn list_layer(
    enumerator: &LayerEnumerator,
    root: &Path,
    dir: &Path,
) -> Result<Vec<ListingEntry>> {
    let mut entries = Vec::new();

    for container in enumerator.enumerate_containers(root)? {
        let sub_path = root.join(container).join(dir);
        let read_dir = match fs::read_dir(&sub_path) {
            Ok(read_dir) => read_dir,
            Err(_) => continue,
        };

        for entry in read_dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry in {:?}: {}", sub_path, e);
                    continue;
                }
            };

            let name = entry.file_name();
            if is_dot_marker(&name) {
                continue;
            }

            let physical_path = entry.path();
            let metadata = fs::symlink_metadata(&physical_path).map_err(|source| {
                Error::MetadataUnavailable {
                    path: physical_path.clone(),
                    source,
                }
            })?;

            entries.push(ListingEntry {
                name,
                physical_path,
                metadata,
            });
        }
    }

    Ok(entries)
}
