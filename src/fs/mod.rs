//! FUSE filesystem implementation
//!
//! Exposes a layered package namespace through the kernel, translating
//! inode-based requests into virtual-path namespace calls.

mod attr;
mod filesystem;
mod handle;
mod inode;

pub use attr::{file_attr, synthetic_root_attr, FileKind};
pub use filesystem::PackageFs;
pub use handle::{HandleTable, OpenFile};
pub use inode::{InodeTable, ROOT_INO};
