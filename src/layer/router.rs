//! Namespace routing between the primary and fallback layers

use super::{
    list_layer, relative, resolve, Caller, ContainerAllocator, LayerEnumerator, LayerRoots,
    ListingEntry, Namespace,
};
use crate::cache::{CacheStats, ContainerCache};
use crate::config::Config;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolution engine over the primary and fallback layers
pub struct NamespaceRouter {
    layers: LayerRoots,
    enumerator: LayerEnumerator,
    allocator: ContainerAllocator,
}

impl NamespaceRouter {
    /// Build the router described by `config`
    pub fn new(config: &Config) -> Self {
        let enumerator = if config.cache.enabled {
            LayerEnumerator::with_cache(ContainerCache::new())
        } else {
            LayerEnumerator::new()
        };

        Self::with_parts(
            LayerRoots::from_config(&config.layers),
            enumerator,
            ContainerAllocator::new(&config.allocator),
        )
    }

    pub fn with_parts(
        layers: LayerRoots,
        enumerator: LayerEnumerator,
        allocator: ContainerAllocator,
    ) -> Self {
        Self {
            layers,
            enumerator,
            allocator,
        }
    }

    pub fn layers(&self) -> &LayerRoots {
        &self.layers
    }

    pub fn allocator(&self) -> &ContainerAllocator {
        &self.allocator
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.enumerator.cache_stats()
    }
}

impl Namespace for NamespaceRouter {
    fn resolve_read(&self, caller: &Caller, path: &Path) -> Result<PathBuf> {
        let rel = relative(path);

        for layer in self.layers.read_layers(caller) {
            match resolve(&self.enumerator, &layer.root, &rel) {
                Ok(physical) => {
                    debug!("resolve_read({:?}) -> {:?} ({:?})", path, physical, layer.role);
                    return Ok(physical);
                }
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::NotFound(path.to_path_buf()))
    }

    fn resolve_write(&self, caller: &Caller, path: &Path) -> PathBuf {
        let layer = self.layers.write_layer(caller);
        let allocation = self.allocator.allocate_or_reuse_container(&layer.root);
        if allocation.created {
            self.enumerator.invalidate(&layer.root);
        }

        let physical = layer.root.join(&allocation.name).join(relative(path));
        debug!("resolve_write({:?}) -> {:?} ({:?})", path, physical, layer.role);
        physical
    }

    fn merge_listing(&self, caller: &Caller, dir: &Path) -> Result<Vec<ListingEntry>> {
        let rel = relative(dir);
        let mut entries = Vec::new();

        for layer in self.layers.read_layers(caller) {
            match list_layer(&self.enumerator, &layer.root, &rel) {
                Ok(layer_entries) => entries.extend(layer_entries),
                Err(Error::LayerUnavailable { root, source }) => {
                    debug!("Layer {:?} contributes nothing: {}", root, source);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("merge_listing({:?}) -> {} entries", dir, entries.len());
        Ok(entries)
    }
}
