//! Caching module
//!
//! Optional memoization of layer enumeration. Disabled unless
//! `cache.enabled` is set; enumeration order is preserved either way.

mod containers;

pub use containers::{CacheStats, ContainerCache};
