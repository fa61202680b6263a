//! Layered package namespace
//!
//! Merges a per-user package directory (primary layer) with a system-wide
//! package directory (fallback layer). Each layer root holds an unordered set
//! of package containers; a virtual path is served by whichever container
//! holds it. New content is routed into time-bucketed `Unsorted-N` containers.

mod allocator;
mod enumerate;
mod merge;
mod resolver;
mod router;

pub use allocator::{Allocation, Clock, ContainerAllocator, SystemClock};
pub use enumerate::{read_containers, LayerEnumerator};
pub use merge::{list_layer, ListingEntry};
pub use resolver::resolve;
pub use router::NamespaceRouter;

#[cfg(test)]
pub(crate) use allocator::ManualClock;

use crate::config::LayerConfig;
use crate::error::Result;
use nix::unistd::{Uid, User};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Identity of the process issuing a filesystem request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Identity of the current process
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Role of a layer in the merged namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    /// Per-user packages, consulted first
    Primary,
    /// System-wide packages
    Fallback,
}

/// A layer resolved for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub role: LayerRole,
    pub root: PathBuf,
}

/// Computes layer roots from the caller identity.
///
/// Nothing is cached: every request re-derives its layers.
#[derive(Debug, Clone)]
pub struct LayerRoots {
    user_root_template: String,
    system_root: PathBuf,
}

impl LayerRoots {
    pub fn new(user_root_template: impl Into<String>, system_root: impl Into<PathBuf>) -> Self {
        Self {
            user_root_template: user_root_template.into(),
            system_root: system_root.into(),
        }
    }

    pub fn from_config(config: &LayerConfig) -> Self {
        Self::new(config.user_root_template.clone(), config.system_root.clone())
    }

    /// Root of the fallback layer
    pub fn system_root(&self) -> &Path {
        &self.system_root
    }

    /// Expand the user root template for `caller`.
    ///
    /// Returns `None` for uid 0 and for uids without a passwd entry when the
    /// template needs a login name.
    pub fn user_root(&self, caller: &Caller) -> Option<PathBuf> {
        if caller.uid == 0 {
            return None;
        }

        let mut root = self.user_root_template.replace("{uid}", &caller.uid.to_string());
        if root.contains("{user}") {
            let user = User::from_uid(Uid::from_raw(caller.uid)).ok().flatten()?;
            root = root.replace("{user}", &user.name);
        }

        Some(PathBuf::from(root))
    }

    /// Primary layer root, only if it exists as a directory
    pub fn primary(&self, caller: &Caller) -> Option<PathBuf> {
        self.user_root(caller).filter(|root| root.is_dir())
    }

    /// Layers to consult for reads and listings, in priority order
    pub fn read_layers(&self, caller: &Caller) -> Vec<Layer> {
        let mut layers = Vec::with_capacity(2);
        if let Some(root) = self.primary(caller) {
            layers.push(Layer {
                role: LayerRole::Primary,
                root,
            });
        }
        layers.push(Layer {
            role: LayerRole::Fallback,
            root: self.system_root.clone(),
        });
        layers
    }

    /// The single layer that receives new content
    pub fn write_layer(&self, caller: &Caller) -> Layer {
        match self.primary(caller) {
            Some(root) => Layer {
                role: LayerRole::Primary,
                root,
            },
            None => Layer {
                role: LayerRole::Fallback,
                root: self.system_root.clone(),
            },
        }
    }
}

/// The three operations the filesystem adapter needs from the resolution engine
pub trait Namespace: Send + Sync {
    /// Physical path serving `path` for reading, or `NotFound`
    fn resolve_read(&self, caller: &Caller, path: &Path) -> Result<PathBuf>;

    /// Physical path that should receive newly created `path`
    fn resolve_write(&self, caller: &Caller, path: &Path) -> PathBuf;

    /// Entries of virtual directory `dir` across every layer and container
    fn merge_listing(&self, caller: &Caller, dir: &Path) -> Result<Vec<ListingEntry>>;
}

impl<N: Namespace + ?Sized> Namespace for Arc<N> {
    fn resolve_read(&self, caller: &Caller, path: &Path) -> Result<PathBuf> {
        (**self).resolve_read(caller, path)
    }

    fn resolve_write(&self, caller: &Caller, path: &Path) -> PathBuf {
        (**self).resolve_write(caller, path)
    }

    fn merge_listing(&self, caller: &Caller, dir: &Path) -> Result<Vec<ListingEntry>> {
        (**self).merge_listing(caller, dir)
    }
}

/// Reduce a virtual path to its normal components, relative to the mount root.
///
/// Root, `.` and `..` components are dropped so a virtual path can never
/// step outside a container.
pub fn relative(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}
