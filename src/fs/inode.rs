//! Virtual inode numbering
//!
//! The kernel speaks inodes while the namespace speaks paths. A virtual path
//! gets an inode number when an entry for it is handed to the kernel and keeps
//! it until the kernel forgets every lookup of it. The mount root is always
//! `FUSE_ROOT_ID` and is never forgotten.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode number of the mount root
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

#[derive(Default)]
struct InodeMaps {
    /// Virtual ino -> virtual path
    paths: HashMap<u64, PathBuf>,
    /// Virtual path -> virtual ino
    inodes: HashMap<PathBuf, u64>,
    /// Virtual ino -> lookups the kernel still holds
    lookups: HashMap<u64, u64>,
}

impl InodeMaps {
    fn drop_ino(&mut self, ino: u64) {
        if let Some(path) = self.paths.remove(&ino) {
            self.inodes.remove(&path);
        }
        self.lookups.remove(&ino);
    }
}

/// Manages virtual inode allocation and mapping
pub struct InodeTable {
    next_ino: AtomicU64,
    maps: RwLock<InodeMaps>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut maps = InodeMaps::default();
        maps.paths.insert(ROOT_INO, PathBuf::new());
        maps.inodes.insert(PathBuf::new(), ROOT_INO);

        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            maps: RwLock::new(maps),
        }
    }

    /// Virtual path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.maps.read().paths.get(&ino).cloned()
    }

    /// Virtual path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Inode already assigned to a virtual path
    pub fn get(&self, path: &Path) -> Option<u64> {
        self.maps.read().inodes.get(path).copied()
    }

    /// Inode for a virtual path handed to the kernel in an entry reply.
    ///
    /// Allocates on first sight and counts one kernel lookup.
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut maps = self.maps.write();
        let ino = match maps.inodes.get(path) {
            Some(&ino) => ino,
            None => {
                let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
                maps.paths.insert(ino, path.to_path_buf());
                maps.inodes.insert(path.to_path_buf(), ino);
                ino
            }
        };
        if ino != ROOT_INO {
            *maps.lookups.entry(ino).or_insert(0) += 1;
        }
        ino
    }

    /// Release `nlookup` kernel lookups of `ino`, dropping it at zero.
    ///
    /// Returns true if the inode was dropped.
    pub fn forget(&self, ino: u64, nlookup: u64) -> bool {
        if ino == ROOT_INO {
            return false;
        }

        let mut maps = self.maps.write();
        let remaining = match maps.lookups.get_mut(&ino) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => return false,
        };

        if remaining == 0 {
            maps.drop_ino(ino);
            true
        } else {
            false
        }
    }

    /// Inode of the directory containing `path`
    pub fn parent_ino(&self, path: &Path) -> u64 {
        path.parent()
            .and_then(|parent| self.get(parent))
            .unwrap_or(ROOT_INO)
    }

    /// Re-key `from` and everything below it to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        let mut maps = self.maps.write();

        if let Some(&replaced) = maps.inodes.get(to) {
            maps.drop_ino(replaced);
        }

        let moved: Vec<(PathBuf, u64)> = maps
            .inodes
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (old_path, ino) in moved {
            let suffix = old_path.strip_prefix(from).unwrap_or(Path::new(""));
            let new_path = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            maps.inodes.remove(&old_path);
            maps.inodes.insert(new_path.clone(), ino);
            maps.paths.insert(ino, new_path);
        }
    }

    /// Forget a removed path
    pub fn remove(&self, path: &Path) {
        let mut maps = self.maps.write();
        if let Some(&ino) = maps.inodes.get(path) {
            maps.drop_ino(ino);
        }
    }

    /// Number of tracked inodes, root included
    pub fn len(&self) -> usize {
        self.maps.read().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
