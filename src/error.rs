//! Error types for packagefs

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for packagefs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for packagefs
#[derive(Error, Debug)]
pub enum Error {
    /// A layer root could not be opened; callers skip the layer
    #[error("Layer unavailable at {root:?}: {source}")]
    LayerUnavailable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No layer or container holds the virtual path
    #[error("Not found: {0:?}")]
    NotFound(PathBuf),

    /// Metadata for a merged listing entry could not be read
    #[error("Metadata unavailable for {path:?}: {source}")]
    MetadataUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Physical filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map to the errno reported back to the kernel
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::LayerUnavailable { source, .. } | Error::MetadataUnavailable { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Config(_) | Error::InvalidConfig(_) => libc::EINVAL,
            Error::Internal(_) => libc::EIO,
        }
    }

    /// Whether this error means the path does not exist in the namespace
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound(PathBuf::from("a")).errno(), libc::ENOENT);
        assert_eq!(
            Error::Io(io::Error::from_raw_os_error(libc::EACCES)).errno(),
            libc::EACCES
        );
        assert_eq!(
            Error::Io(io::Error::new(io::ErrorKind::Other, "boom")).errno(),
            libc::EIO
        );
        assert_eq!(Error::InvalidConfig("x".into()).errno(), libc::EINVAL);
    }

    #[test]
    fn test_metadata_unavailable_keeps_os_error() {
        let err = Error::MetadataUnavailable {
            path: PathBuf::from("/p/a"),
            source: io::Error::from_raw_os_error(libc::ELOOP),
        };
        assert_eq!(err.errno(), libc::ELOOP);
        assert!(!err.is_not_found());
    }
}
