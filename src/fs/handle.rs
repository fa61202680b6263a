//! File handle management

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An open physical file behind a FUSE file handle
pub struct OpenFile {
    /// Virtual inode
    pub ino: u64,
    /// Physical path at open time
    pub physical_path: PathBuf,
    /// Open flags
    pub flags: i32,
    file: File,
}

impl OpenFile {
    pub fn new(ino: u64, physical_path: PathBuf, file: File, flags: i32) -> Self {
        Self {
            ino,
            physical_path,
            flags,
            file,
        }
    }

    /// Check if opened for reading
    pub fn is_readable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Read up to `size` bytes at `offset`, short only at end of file
    pub fn read_at(&self, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Write all of `data` at `offset`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    pub fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    pub fn sync(&self, datasync: bool) -> io::Result<()> {
        if datasync {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        }
    }
}

/// Manages open file handles
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<OpenFile>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open file and return its handle ID
    pub fn open(&self, file: OpenFile) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, Arc::new(file));
        fh
    }

    /// Get a handle by ID
    pub fn get(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Close a handle
    pub fn close(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.write().remove(&fh)
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn open_file(path: &std::path::Path, flags: i32) -> OpenFile {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap();
        OpenFile::new(7, path.to_path_buf(), file, flags)
    }

    #[test]
    fn test_open_file_flags() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");

        let read_handle = open_file(&path, libc::O_RDONLY);
        assert!(read_handle.is_readable());
        assert!(!read_handle.is_writable());

        let rw_handle = open_file(&path, libc::O_RDWR);
        assert!(rw_handle.is_readable());
        assert!(rw_handle.is_writable());
    }

    #[test]
    fn test_read_write_at() {
        let dir = tempdir().unwrap();
        let handle = open_file(&dir.path().join("f"), libc::O_RDWR);

        assert_eq!(handle.write_at(0, b"hello world").unwrap(), 11);
        assert_eq!(handle.read_at(6, 100).unwrap(), b"world");
        assert!(handle.read_at(64, 10).unwrap().is_empty());

        handle.set_len(5).unwrap();
        assert_eq!(handle.read_at(0, 100).unwrap(), b"hello");
    }

    #[test]
    fn test_handle_table() {
        let dir = tempdir().unwrap();
        let table = HandleTable::new();

        let fh1 = table.open(open_file(&dir.path().join("a"), libc::O_RDONLY));
        let fh2 = table.open(open_file(&dir.path().join("b"), libc::O_RDWR));

        assert!(table.get(fh1).is_some());
        assert_eq!(table.get(fh2).unwrap().ino, 7);
        assert!(table.get(999).is_none());
        assert_eq!(table.len(), 2);

        table.close(fh1);
        assert!(table.get(fh1).is_none());
        assert!(table.get(fh2).is_some());
    }
}
