//! packagefs - Layered package filesystem
//!
//! This library provides a FUSE-based filesystem that merges a per-user
//! package directory with a system-wide one into a single virtual tree,
//! routing newly created content into time-bucketed containers.

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod layer;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::layer::{Caller, Namespace, NamespaceRouter};
}
