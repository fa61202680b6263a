//! New-container allocation
//!
//! Writes are bucketed by time: every write inside one window lands in the
//! same `Unsorted-N` container, and the first write after the window has
//! elapsed opens `Unsorted-N+1`. Windows open on demand, never on a timer.

use crate::config::AllocatorConfig;
use parking_lot::Mutex;
use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Time source for the allocator
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests
#[cfg(test)]
pub(crate) struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// Outcome of one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Container name under the layer root
    pub name: String,
    /// Whether this call created the container directory
    pub created: bool,
}

struct AllocatorState {
    counter: u64,
    last_creation: Option<Instant>,
}

/// Chooses the container that receives new content.
///
/// The counter and timestamp live behind one lock; the directory creation
/// happens under the same lock so concurrent writers in one window agree on
/// a single container.
pub struct ContainerAllocator {
    prefix: String,
    interval: Duration,
    dir_mode: u32,
    clock: Arc<dyn Clock>,
    state: Mutex<AllocatorState>,
}

impl ContainerAllocator {
    pub fn new(config: &AllocatorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &AllocatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            prefix: config.container_prefix.clone(),
            interval: Duration::from_secs(config.interval_secs),
            dir_mode: config.dir_mode,
            clock,
            state: Mutex::new(AllocatorState {
                counter: 0,
                last_creation: None,
            }),
        }
    }

    /// Number of windows opened so far
    pub fn counter(&self) -> u64 {
        self.state.lock().counter
    }

    /// Container name for a given counter value
    pub fn container_name(&self, counter: u64) -> String {
        format!("{}{}", self.prefix, counter)
    }

    /// Pick the container under `layer_root` for a new entry, creating it
    /// when a new window opens.
    ///
    /// Creation failures are logged, not returned: the caller's own
    /// filesystem operation on the resulting path reports them.
    pub fn allocate_or_reuse_container(&self, layer_root: &Path) -> Allocation {
        let mut state = self.state.lock();
        let now = self.clock.now();

        let window_elapsed = match state.last_creation {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        };

        if window_elapsed {
            state.counter += 1;
            state.last_creation = Some(now);
            let name = self.container_name(state.counter);
            let created = self.create_container(&layer_root.join(&name));
            if created {
                info!("Opened new container {:?} in {:?}", name, layer_root);
            }
            return Allocation { name, created };
        }

        let name = self.container_name(state.counter);
        let path = layer_root.join(&name);
        // Same window, different layer: the bucket may not exist here yet
        let created = !path.is_dir() && self.create_container(&path);
        debug!("Reusing container {:?} in {:?}", name, layer_root);
        Allocation { name, created }
    }

    /// Returns true only if this call made the directory
    fn create_container(&self, path: &Path) -> bool {
        match DirBuilder::new().mode(self.dir_mode).create(path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
            Err(e) => {
                warn!("Failed to create container {:?}: {}", path, e);
                false
            }
        }
    }
}
