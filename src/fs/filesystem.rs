//! Package FUSE filesystem
//!
//! Pure passthrough: every kernel request is turned into one namespace call
//! (resolve for reading, route for creating, or merge for listing) followed
//! by the matching operating-system call on the physical path.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use nix::sys::stat::{utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;
use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use super::{
    attr::{file_attr, synthetic_root_attr, FileKind},
    handle::{HandleTable, OpenFile},
    inode::{InodeTable, ROOT_INO},
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::layer::{relative, Caller, Namespace};

fn caller(req: &Request<'_>) -> Caller {
    Caller::new(req.uid(), req.gid())
}

/// Timestamp argument for utimensat; an absent time is left untouched
fn timespec(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        None => TimeSpec::UTIME_OMIT,
        Some(TimeOrNow::Now) => TimeSpec::UTIME_NOW,
        Some(TimeOrNow::SpecificTime(t)) => {
            TimeSpec::from_duration(t.duration_since(UNIX_EPOCH).unwrap_or_default())
        }
    }
}

/// Answer an xattr size probe or copy the value out
fn reply_xattr(reply: ReplyXattr, size: u32, data: &[u8]) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() <= size as usize {
        reply.data(data);
    } else {
        reply.error(libc::ERANGE);
    }
}

/// Permission bits requested by the kernel, with the caller's umask applied
fn creation_mode(mode: u32, umask: u32) -> u32 {
    mode & !umask & 0o7777
}

/// FUSE filesystem over a layered package namespace
pub struct PackageFs<N: Namespace> {
    namespace: N,
    /// Virtual inode numbering
    inodes: InodeTable,
    /// Open files
    handles: HandleTable,
    /// Attribute/entry TTL
    ttl: Duration,
    /// statfs target when the mount root has no physical backing yet
    statfs_fallback: PathBuf,
    /// Hand created entries to the requesting user (daemon running as root)
    chown_created: bool,
}

impl<N: Namespace> PackageFs<N> {
    pub fn new(namespace: N, config: &Config) -> Self {
        Self {
            namespace,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            ttl: Duration::from_secs(config.mount.attr_ttl_secs),
            statfs_fallback: config.layers.system_root.clone(),
            chown_created: nix::unistd::geteuid().is_root(),
        }
    }

    fn virtual_path(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::NotFound(PathBuf::from(format!("<inode {}>", ino))))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        self.inodes
            .child_path(parent, name)
            .ok_or_else(|| Error::NotFound(PathBuf::from(name)))
    }

    /// Attributes of an inode the kernel already knows
    fn attr_for(&self, caller: &Caller, ino: u64) -> Result<FileAttr> {
        let path = self.virtual_path(ino)?;
        match self.namespace.resolve_read(caller, &path) {
            Ok(physical) => {
                let meta = fs::symlink_metadata(&physical)?;
                Ok(file_attr(ino, &meta))
            }
            // The mount root exists even before any container does
            Err(e) if ino == ROOT_INO && e.is_not_found() => {
                Ok(synthetic_root_attr(caller.uid, caller.gid))
            }
            Err(e) => Err(e),
        }
    }

    /// Attributes of `name` in `parent`, counting one kernel lookup
    fn do_lookup(&self, caller: &Caller, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        let physical = self.namespace.resolve_read(caller, &path)?;
        let meta = fs::symlink_metadata(&physical)?;
        Ok(file_attr(self.inodes.lookup(&path), &meta))
    }

    fn physical_for(&self, caller: &Caller, ino: u64) -> Result<PathBuf> {
        let path = self.virtual_path(ino)?;
        self.namespace.resolve_read(caller, &path)
    }

    /// Route a new virtual path and create the directories it needs inside
    /// its container. A container that failed to materialize is left alone so
    /// the following OS call reports the failure.
    fn prepare_create(&self, caller: &Caller, path: &Path) -> Result<PathBuf> {
        let physical = self.namespace.resolve_write(caller, path);
        let depth = relative(path).components().count();

        if let (Some(container), Some(parent)) = (physical.ancestors().nth(depth), physical.parent())
        {
            if parent != container && container.is_dir() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(physical)
    }

    /// Fix ownership of a created entry and report its attributes
    fn finish_create(&self, caller: &Caller, path: &Path, physical: &Path) -> Result<FileAttr> {
        if self.chown_created {
            if let Err(e) = std::os::unix::fs::lchown(physical, Some(caller.uid), Some(caller.gid)) {
                warn!("Failed to chown {:?} to {}:{}: {}", physical, caller.uid, caller.gid, e);
            }
        }
        let meta = fs::symlink_metadata(physical)?;
        Ok(file_attr(self.inodes.lookup(path), &meta))
    }

    #[allow(clippy::too_many_arguments)]
    fn do_setattr(
        &self,
        caller: &Caller,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr> {
        let physical = self.physical_for(caller, ino)?;

        if let Some(mode) = mode {
            fs::set_permissions(&physical, Permissions::from_mode(mode & 0o7777))?;
        }

        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::lchown(&physical, uid, gid)?;
        }

        if let Some(size) = size {
            match fh.and_then(|fh| self.handles.get(fh)) {
                Some(handle) if handle.ino == ino && handle.is_writable() => handle.set_len(size)?,
                _ => OpenOptions::new().write(true).open(&physical)?.set_len(size)?,
            }
        }

        if atime.is_some() || mtime.is_some() {
            // Path based: opening a FIFO here would block the session
            utimensat(
                None,
                &physical,
                &timespec(atime),
                &timespec(mtime),
                UtimensatFlags::FollowSymlink,
            )
            .map_err(std::io::Error::from)?;
        }

        let meta = fs::symlink_metadata(&physical)?;
        Ok(file_attr(ino, &meta))
    }

    fn do_mknod(
        &self,
        caller: &Caller,
        path: &Path,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<FileAttr> {
        let physical = self.prepare_create(caller, path)?;
        let file_type = mode & libc::S_IFMT as u32;

        if file_type == libc::S_IFREG as u32 || file_type == 0 {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(creation_mode(mode, umask))
                .open(&physical)?;
        } else {
            nix::sys::stat::mknod(
                &physical,
                SFlag::from_bits_truncate(file_type as libc::mode_t),
                Mode::from_bits_truncate(creation_mode(mode, umask) as libc::mode_t),
                rdev as libc::dev_t,
            )
            .map_err(std::io::Error::from)?;
        }

        self.finish_create(caller, path, &physical)
    }

    fn do_rename(&self, caller: &Caller, from: &Path, to: &Path) -> Result<()> {
        let source = self.namespace.resolve_read(caller, from)?;
        let target = self.prepare_create(caller, to)?;
        fs::rename(&source, &target)?;
        self.inodes.rename(from, to);
        Ok(())
    }

    fn do_open(&self, caller: &Caller, ino: u64, flags: i32) -> Result<u64> {
        let physical = self.physical_for(caller, ino)?;

        let accmode = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode != libc::O_WRONLY)
            .write(accmode != libc::O_RDONLY)
            .custom_flags(flags & !libc::O_ACCMODE)
            .open(&physical)?;

        Ok(self.handles.open(OpenFile::new(ino, physical, file, flags)))
    }

    fn do_create(
        &self,
        caller: &Caller,
        path: &Path,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(FileAttr, u64)> {
        let physical = self.prepare_create(caller, path)?;

        // O_CREAT always needs write access from std, whatever the caller asked
        let accmode = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode != libc::O_WRONLY)
            .write(true)
            .create(true)
            .custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT))
            .mode(creation_mode(mode, umask))
            .open(&physical)?;

        let attr = self.finish_create(caller, path, &physical)?;
        let fh = self
            .handles
            .open(OpenFile::new(attr.ino, physical, file, flags));
        Ok((attr, fh))
    }

    // Extended attributes act on the entry itself, never a symlink's target

    fn do_setxattr(&self, caller: &Caller, ino: u64, name: &OsStr, value: &[u8]) -> Result<()> {
        let physical = self.physical_for(caller, ino)?;
        xattr::set(&physical, name, value)?;
        Ok(())
    }

    fn do_getxattr(&self, caller: &Caller, ino: u64, name: &OsStr) -> Result<Option<Vec<u8>>> {
        let physical = self.physical_for(caller, ino)?;
        Ok(xattr::get(&physical, name)?)
    }

    /// Attribute names as the kernel expects them: NUL-terminated, back to back
    fn do_listxattr(&self, caller: &Caller, ino: u64) -> Result<Vec<u8>> {
        let physical = self.physical_for(caller, ino)?;
        let mut data = Vec::new();
        for name in xattr::list(&physical)? {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        Ok(data)
    }

    fn do_removexattr(&self, caller: &Caller, ino: u64, name: &OsStr) -> Result<()> {
        let physical = self.physical_for(caller, ino)?;
        xattr::remove(&physical, name)?;
        Ok(())
    }

    fn read_merged_dir(&self, caller: &Caller, ino: u64) -> Result<Vec<(u64, FileType, OsString)>> {
        let dir = self.virtual_path(ino)?;
        let listing = self.namespace.merge_listing(caller, &dir)?;

        let mut entries = Vec::with_capacity(listing.len() + 2);
        entries.push((ino, FileType::Directory, OsString::from(".")));
        entries.push((self.inodes.parent_ino(&dir), FileType::Directory, OsString::from("..")));

        // Plain readdir does not count as a lookup, so unseen names report
        // their physical inode number instead of taking a table slot
        for entry in listing {
            let child_ino = self
                .inodes
                .get(&dir.join(&entry.name))
                .unwrap_or_else(|| entry.metadata.ino());
            let kind = FileKind::from(entry.metadata.file_type()).to_fuser_type();
            entries.push((child_ino, kind, entry.name));
        }

        Ok(entries)
    }
}

impl<N: Namespace> Filesystem for PackageFs<N> {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        info!("packagefs initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            "packagefs destroyed ({} inodes seen, {} handles still open)",
            self.inodes.len(),
            self.handles.len()
        );
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.do_lookup(&caller(req), parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if self.inodes.forget(ino, nlookup) {
            debug!("forget(ino={}) dropped", ino);
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.attr_for(&caller(req), ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        match self.do_setattr(&caller(req), ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let result = self
            .physical_for(&caller(req), ino)
            .and_then(|physical| fs::read_link(physical).map_err(Error::from));
        match result {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let result = self
            .child_path(parent, name)
            .and_then(|path| self.do_mknod(&caller(req), &path, mode, umask, rdev));
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let caller = caller(req);
        let result = self.child_path(parent, name).and_then(|path| {
            let physical = self.prepare_create(&caller, &path)?;
            DirBuilder::new()
                .mode(creation_mode(mode, umask))
                .create(&physical)?;
            self.finish_create(&caller, &path, &physical)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let result = self.child_path(parent, name).and_then(|path| {
            let physical = self.namespace.resolve_read(&caller(req), &path)?;
            fs::remove_file(&physical)?;
            self.inodes.remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let result = self.child_path(parent, name).and_then(|path| {
            let physical = self.namespace.resolve_read(&caller(req), &path)?;
            fs::remove_dir(&physical)?;
            self.inodes.remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let caller = caller(req);
        let result = self.child_path(parent, link_name).and_then(|path| {
            let physical = self.prepare_create(&caller, &path)?;
            std::os::unix::fs::symlink(target, &physical)?;
            self.finish_create(&caller, &path, &physical)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?}, flags={})",
            parent, name, newparent, newname, flags
        );

        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.do_rename(&caller(req), &from, &to)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let caller = caller(req);
        let result = self.virtual_path(ino).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            let source = self.namespace.resolve_read(&caller, &from)?;
            let target = self.prepare_create(&caller, &to)?;
            fs::hard_link(&source, &target)?;
            let meta = fs::symlink_metadata(&target)?;
            Ok(file_attr(self.inodes.lookup(&to), &meta))
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        match self.do_open(&caller(req), ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let handle = match self.handles.get(fh) {
            Some(h) => h,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        if !handle.is_readable() {
            reply.error(libc::EBADF);
            return;
        }

        match handle.read_at(offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("Failed to read {:?}: {}", handle.physical_path, e);
                reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let handle = match self.handles.get(fh) {
            Some(h) => h,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        if !handle.is_writable() {
            reply.error(libc::EBADF);
            return;
        }

        match handle.write_at(offset.max(0) as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("Failed to write {:?}: {}", handle.physical_path, e);
                reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            }
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        debug!("flush(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        match self.handles.get(fh) {
            Some(handle) => match handle.sync(datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.read_merged_dir(&caller(req), ino) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to list inode {}: {}", ino, e);
                reply.error(e.errno());
                return;
            }
        };

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, *kind, name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);

        let target = self
            .physical_for(&caller(req), ino)
            .unwrap_or_else(|_| self.statfs_fallback.clone());

        match nix::sys::statvfs::statvfs(&target) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(errno) => reply.error(errno as libc::c_int),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        let path = match self.virtual_path(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        match self.namespace.resolve_read(&caller(req), &path) {
            Ok(physical) => {
                match nix::unistd::access(&physical, AccessFlags::from_bits_truncate(mask)) {
                    Ok(()) => reply.ok(),
                    Err(errno) => reply.error(errno as libc::c_int),
                }
            }
            Err(e) if ino == ROOT_INO && e.is_not_found() => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o}, flags={:#x})", parent, name, mode, flags);

        let result = self
            .child_path(parent, name)
            .and_then(|path| self.do_create(&caller(req), &path, mode, umask, flags));
        match result {
            Ok((attr, fh)) => reply.created(&self.ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?}, len={})", ino, name, value.len());

        match self.do_setxattr(&caller(req), ino, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        match self.do_getxattr(&caller(req), ino, name) {
            Ok(Some(value)) => reply_xattr(reply, size, &value),
            #[cfg(target_os = "macos")]
            Ok(None) => reply.error(libc::ENOATTR),
            #[cfg(not(target_os = "macos"))]
            Ok(None) => reply.error(libc::ENODATA),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);

        match self.do_listxattr(&caller(req), ino) {
            Ok(data) => reply_xattr(reply, size, &data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);

        match self.do_removexattr(&caller(req), ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::ListingEntry;
    use tempfile::tempdir;

    /// Namespace with one container per layer and a fixed write target
    struct FixedNamespace {
        read_root: PathBuf,
        write_root: PathBuf,
    }

    impl Namespace for FixedNamespace {
        fn resolve_read(&self, _caller: &Caller, path: &Path) -> Result<PathBuf> {
            let physical = self.read_root.join(relative(path));
            if fs::symlink_metadata(&physical).is_ok() {
                Ok(physical)
            } else {
                Err(Error::NotFound(path.to_path_buf()))
            }
        }

        fn resolve_write(&self, _caller: &Caller, path: &Path) -> PathBuf {
            self.write_root.join(relative(path))
        }

        fn merge_listing(&self, _caller: &Caller, dir: &Path) -> Result<Vec<ListingEntry>> {
            let mut entries = Vec::new();
            for entry in fs::read_dir(self.read_root.join(relative(dir)))? {
                let entry = entry?;
                entries.push(ListingEntry {
                    name: entry.file_name(),
                    physical_path: entry.path(),
                    metadata: fs::symlink_metadata(entry.path())?,
                });
            }
            Ok(entries)
        }
    }

    fn filesystem(read_root: &Path, write_root: &Path) -> PackageFs<FixedNamespace> {
        PackageFs::new(
            FixedNamespace {
                read_root: read_root.to_path_buf(),
                write_root: write_root.to_path_buf(),
            },
            &Config::default(),
        )
    }

    fn user() -> Caller {
        Caller::current()
    }

    #[test]
    fn test_root_attr_without_backing() {
        let dir = tempdir().unwrap();
        let fs = filesystem(&dir.path().join("missing"), dir.path());

        let attr = fs.attr_for(&user(), ROOT_INO).unwrap();
        assert_eq!(attr.ino, ROOT_INO);
        assert_eq!(attr.kind, FileType::Directory);

        let err = fs.do_lookup(&user(), ROOT_INO, OsStr::new("nope")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(fs.inodes.len(), 1);
    }

    #[test]
    fn test_prepare_create_builds_nested_dirs_in_container() {
        let dir = tempdir().unwrap();
        let container = dir.path().join("Unsorted-1");
        fs::create_dir(&container).unwrap();
        let fs = filesystem(dir.path(), &container);

        let physical = fs.prepare_create(&user(), Path::new("share/doc/README")).unwrap();
        assert_eq!(physical, container.join("share/doc/README"));
        assert!(container.join("share/doc").is_dir());
    }

    #[test]
    fn test_prepare_create_leaves_missing_container_alone() {
        let dir = tempdir().unwrap();
        let container = dir.path().join("Unsorted-1");
        let fs = filesystem(dir.path(), &container);

        fs.prepare_create(&user(), Path::new("share/README")).unwrap();
        assert!(!container.exists());
    }

    #[test]
    fn test_create_then_open_and_read() {
        let dir = tempdir().unwrap();
        let container = dir.path().join("pkg");
        fs::create_dir(&container).unwrap();
        let fs = filesystem(&container, &container);

        let (attr, fh) = fs
            .do_create(&user(), Path::new("hello.txt"), 0o100644, 0o022, libc::O_WRONLY)
            .unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);

        let handle = fs.handles.get(fh).unwrap();
        handle.write_at(0, b"hi there").unwrap();
        fs.handles.close(fh);

        let fh = fs.do_open(&user(), attr.ino, libc::O_RDONLY).unwrap();
        let data = fs.handles.get(fh).unwrap().read_at(0, 64).unwrap();
        assert_eq!(data, b"hi there");
    }

    #[test]
    fn test_mknod_regular_file() {
        let dir = tempdir().unwrap();
        let fs = filesystem(dir.path(), dir.path());

        let attr = fs
            .do_mknod(&user(), Path::new("node"), libc::S_IFREG as u32 | 0o640, 0, 0)
            .unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert!(dir.path().join("node").is_file());
    }

    #[test]
    fn test_rename_moves_inode() {
        let dir = tempdir().unwrap();
        let read_root = dir.path().join("read");
        let write_root = dir.path().join("write");
        fs::create_dir(&read_root).unwrap();
        fs::create_dir(&write_root).unwrap();
        fs::write(read_root.join("old"), b"x").unwrap();

        let fs = filesystem(&read_root, &write_root);
        let ino = fs.inodes.lookup(Path::new("old"));

        fs.do_rename(&user(), Path::new("old"), Path::new("new")).unwrap();
        assert!(write_root.join("new").is_file());
        assert!(!read_root.join("old").exists());
        assert_eq!(fs.inodes.path(ino), Some(PathBuf::from("new")));
    }

    #[test]
    fn test_rename_missing_source() {
        let dir = tempdir().unwrap();
        let fs = filesystem(dir.path(), dir.path());
        let err = fs
            .do_rename(&user(), Path::new("ghost"), Path::new("new"))
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_setattr_truncate_and_chmod() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"0123456789").unwrap();
        let fs = filesystem(dir.path(), dir.path());
        let ino = fs.inodes.lookup(Path::new("f"));

        let attr = fs
            .do_setattr(&user(), ino, Some(0o600), None, None, Some(4), None, None, None)
            .unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(attr.perm, 0o600);
    }

    #[test]
    fn test_readdir_includes_dot_entries() {
        let dir = tempdir().unwrap();
        let fs = filesystem(dir.path(), dir.path());

        let entries = fs.read_merged_dir(&user(), ROOT_INO).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].2, ".");
        assert_eq!(entries[1].2, "..");
        assert_eq!(entries[1].0, ROOT_INO);
    }

    #[test]
    fn test_setattr_times_on_fifo_does_not_block() {
        use std::sync::{mpsc, Arc};

        let dir = tempdir().unwrap();
        nix::unistd::mkfifo(&dir.path().join("pipe"), Mode::from_bits_truncate(0o644)).unwrap();
        let fs = Arc::new(filesystem(dir.path(), dir.path()));
        let ino = fs.inodes.lookup(Path::new("pipe"));

        let (tx, rx) = mpsc::channel();
        let worker = fs.clone();
        std::thread::spawn(move || {
            let result = worker.do_setattr(
                &user(),
                ino,
                None,
                None,
                None,
                None,
                Some(TimeOrNow::Now),
                Some(TimeOrNow::Now),
                None,
            );
            let _ = tx.send(result.map(|attr| attr.kind));
        });

        let kind = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("setattr on a FIFO blocked")
            .unwrap();
        assert_eq!(kind, FileType::NamedPipe);
    }

    #[test]
    fn test_setattr_specific_times_on_write_only_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, b"x").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o200)).unwrap();
        let fs = filesystem(dir.path(), dir.path());
        let ino = fs.inodes.lookup(Path::new("log"));

        let stamp = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let attr = fs
            .do_setattr(
                &user(),
                ino,
                None,
                None,
                None,
                None,
                None,
                Some(TimeOrNow::SpecificTime(stamp)),
                None,
            )
            .unwrap();
        assert_eq!(attr.mtime, stamp);
        // atime was omitted, so it must not have been reset to the epoch
        assert_ne!(attr.atime, UNIX_EPOCH);
    }

    #[test]
    fn test_readdir_leaves_inode_table_alone() {
        let dir = tempdir().unwrap();
        for i in 0..50 {
            fs::write(dir.path().join(format!("file-{}", i)), b"").unwrap();
        }
        let fs = filesystem(dir.path(), dir.path());

        let entries = fs.read_merged_dir(&user(), ROOT_INO).unwrap();
        assert_eq!(entries.len(), 52);
        assert_eq!(fs.inodes.len(), 1);

        let attr = fs.do_lookup(&user(), ROOT_INO, OsStr::new("file-7")).unwrap();
        assert_eq!(fs.inodes.len(), 2);

        // A looked-up name keeps its virtual inode in later listings
        let entries = fs.read_merged_dir(&user(), ROOT_INO).unwrap();
        let listed = entries.iter().find(|(_, _, name)| name == "file-7").unwrap();
        assert_eq!(listed.0, attr.ino);

        assert!(fs.inodes.forget(attr.ino, 1));
        assert_eq!(fs.inodes.len(), 1);
    }

    #[test]
    fn test_truncate_ignores_handle_of_other_inode() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"0123456789").unwrap();
        fs::write(dir.path().join("b"), b"0123456789").unwrap();
        let fs = filesystem(dir.path(), dir.path());
        let a = fs.inodes.lookup(Path::new("a"));
        let b = fs.inodes.lookup(Path::new("b"));

        let fh = fs.do_open(&user(), b, libc::O_RDWR).unwrap();
        let attr = fs
            .do_setattr(&user(), a, None, None, None, Some(3), None, None, Some(fh))
            .unwrap();

        assert_eq!(attr.size, 3);
        assert_eq!(fs::metadata(dir.path().join("b")).unwrap().len(), 10);
    }

    #[test]
    fn test_xattr_passthrough() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tagged"), b"").unwrap();
        let fs = filesystem(dir.path(), dir.path());
        let ino = fs.inodes.lookup(Path::new("tagged"));
        let name = OsStr::new("user.packagefs.test");

        match fs.do_setxattr(&user(), ino, name, b"value") {
            Ok(()) => {}
            // Backing filesystem without user xattrs
            Err(e) if e.errno() == libc::ENOTSUP => return,
            Err(e) => panic!("setxattr failed: {}", e),
        }

        assert_eq!(
            fs.do_getxattr(&user(), ino, name).unwrap(),
            Some(b"value".to_vec())
        );
        let listed = fs.do_listxattr(&user(), ino).unwrap();
        assert!(listed
            .split(|&b| b == 0)
            .any(|entry| entry == b"user.packagefs.test"));

        fs.do_removexattr(&user(), ino, name).unwrap();
        assert_eq!(fs.do_getxattr(&user(), ino, name).unwrap(), None);

        let err = fs.do_getxattr(&user(), 999, name).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
