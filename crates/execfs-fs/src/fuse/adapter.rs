//! FUSE adapter implementation for execfs.
//!
//! This module implements the `fuser::Filesystem` trait for `ExecFuseFS`.

use super::inodes::{InodeTable, UNKNOWN_INO};
use crate::attr::{AttributeSnapshot, NodeKind};
use crate::error::Fault;
use crate::vfs::ExecFs;
use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use libc::{EINVAL, ENOENT, ENOTDIR};
use log::{debug, error, trace, warn};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Time-to-live for cached attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// Block size for filesystem statistics.
const BLOCK_SIZE: u32 = 512;

/// Maximum file name length.
const NAME_MAX: u32 = 255;

/// Options passed through to the FUSE mount.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Mount read-only.
    pub read_only: bool,
    /// Let users other than the mounting user access the tree.
    pub allow_other: bool,
    /// Raw `-o` options forwarded as-is.
    pub custom: Vec<String>,
}

impl MountOptions {
    fn to_fuser(&self) -> Vec<MountOption> {
        let mut options = vec![
            if self.read_only {
                MountOption::RO
            } else {
                MountOption::RW
            },
            MountOption::FSName("execfs".to_string()),
            MountOption::Subtype("execfs".to_string()),
            MountOption::DefaultPermissions,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        options.extend(self.custom.iter().cloned().map(MountOption::CUSTOM));
        options
    }
}

/// FUSE filesystem adapter over [`ExecFs`].
pub struct ExecFuseFS {
    fs: ExecFs,
    inodes: InodeTable,
}

impl ExecFuseFS {
    pub fn new(fs: ExecFs) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.path(ino).map(Path::to_path_buf)
    }
}

fn file_attr(ino: u64, snapshot: &AttributeSnapshot) -> FileAttr {
    FileAttr {
        ino,
        size: snapshot.size,
        blocks: snapshot.size.div_ceil(BLOCK_SIZE as u64),
        atime: snapshot.atime,
        mtime: snapshot.mtime,
        ctime: snapshot.ctime,
        crtime: snapshot.mtime,
        kind: file_type(snapshot.kind),
        perm: snapshot.perm,
        nlink: snapshot.nlink,
        uid: snapshot.uid,
        gid: snapshot.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
    }
}

impl Filesystem for ExecFuseFS {
    /// Reap every program still running at unmount.
    fn destroy(&mut self) {
        debug!("destroy: {} open handles", self.fs.open_handles());
        self.fs.shutdown();
    }

    /// Look up a directory entry by name.
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!("lookup(parent={}, name={:?})", parent, name);

        let Some(path) = self.inodes.child_path(parent, name) else {
            debug!("lookup: parent {} unknown", parent);
            reply.error(ENOENT);
            return;
        };

        match self.fs.lookup(&path) {
            Ok(snapshot) => {
                let ino = self.inodes.remember(path);
                reply.entry(&TTL, &file_attr(ino, &snapshot), 0);
            }
            Err(fault) => {
                debug!("lookup: {}: {}", path.display(), fault);
                reply.error(fault.errno());
            }
        }
    }

    /// Drop kernel references to an inode.
    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        trace!("forget(ino={}, nlookup={})", ino, nlookup);
        self.inodes.forget(ino, nlookup);
    }

    /// Get file attributes, sized from the open handle when there is one.
    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr(ino={}, fh={:?})", ino, fh);

        let Some(path) = self.path(ino) else {
            warn!("getattr: inode {} not found", ino);
            reply.error(ENOENT);
            return;
        };

        match self.fs.getattr(&path, fh) {
            Ok(snapshot) => reply.attr(&TTL, &file_attr(ino, &snapshot)),
            Err(fault) => reply.error(fault.errno()),
        }
    }

    /// Change permissions of the backing file. Truncation is accepted and
    /// ignored so that `>` redirections into a virtual file work.
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);

        let Some(path) = self.path(ino) else {
            reply.error(ENOENT);
            return;
        };

        let result = match mode {
            Some(mode) => self
                .fs
                .set_mode(&path, mode)
                .and_then(|_| self.fs.getattr(&path, fh)),
            None => self.fs.getattr(&path, fh),
        };

        match result {
            Ok(snapshot) => reply.attr(&TTL, &file_attr(ino, &snapshot)),
            Err(fault) => {
                debug!("setattr: {}: {}", path.display(), fault);
                reply.error(fault.errno());
            }
        }
    }

    /// Read directory entries.
    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!("readdir(ino={}, offset={})", ino, offset);

        let Some(path) = self.path(ino) else {
            reply.error(ENOENT);
            return;
        };

        let listing = match self.fs.readdir(&path) {
            Ok(listing) => listing,
            Err(Fault::NotDirectory) => {
                warn!("readdir: inode {} is not a directory", ino);
                reply.error(ENOTDIR);
                return;
            }
            Err(fault) => {
                reply.error(fault.errno());
                return;
            }
        };

        // "." and ".." followed by the backing entries; ".." of a
        // subdirectory is reported as root since the kernel resolves it
        // through its own dentry cache.
        let mut entries = vec![
            (ino, FileType::Directory, OsStr::new(".").to_os_string()),
            (FUSE_ROOT_ID, FileType::Directory, OsStr::new("..").to_os_string()),
        ];
        for entry in listing {
            let child = path.join(&entry.name);
            let child = self.inodes.existing(&child).unwrap_or(UNKNOWN_INO);
            entries.push((child, file_type(entry.kind), entry.name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // next_offset = i + 1
            let full = reply.add(ino, (i + 1) as i64, kind, &name);
            if full {
                break;
            }
        }

        reply.ok();
    }

    /// Open a file: start its program.
    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!("open(ino={}, flags={:#o})", ino, flags);

        let Some(path) = self.path(ino) else {
            reply.error(ENOENT);
            return;
        };

        match self.fs.open(&path, flags) {
            Ok(fh) => reply.opened(fh, FOPEN_DIRECT_IO),
            Err(fault @ Fault::Exec(_)) => {
                error!("open: {}: {}", path.display(), fault);
                reply.error(fault.errno());
            }
            Err(fault) => {
                debug!("open: {}: {}", path.display(), fault);
                reply.error(fault.errno());
            }
        }
    }

    /// Read program output.
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(EINVAL);
            return;
        }

        let timeout = self.fs.config().read_timeout;
        let result = if timeout.is_zero() {
            self.fs.read(fh, offset as u64, size as usize)
        } else {
            self.fs.read_wait(fh, offset as u64, size as usize, timeout)
        };

        match result {
            Ok(bytes) => {
                trace!("read: {} bytes from offset {}", bytes.len(), offset);
                reply.data(&bytes);
            }
            Err(fault) => reply.error(fault.errno()),
        }
    }

    /// Forward data to the program's stdin.
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        match self.fs.write(fh, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(fault) => {
                warn!("write: handle {}: {}", fh, fault);
                reply.error(fault.errno());
            }
        }
    }

    /// Close the program's stdin.
    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!("flush(ino={}, fh={})", ino, fh);

        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(fault) => reply.error(fault.errno()),
        }
    }

    /// End the program and forget its output.
    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release(ino={}, fh={})", ino, fh);

        match self.fs.release(fh) {
            Ok(_) => reply.ok(),
            Err(fault) => {
                warn!("release: handle {}: {}", fh, fault);
                reply.error(fault.errno());
            }
        }
    }

    /// Get filesystem statistics.
    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        trace!("statfs");

        reply.statfs(
            0, // total blocks
            0, // free blocks
            0, // available blocks
            0, // total inodes
            0, // free inodes
            BLOCK_SIZE,
            NAME_MAX,
            BLOCK_SIZE,
        );
    }
}

/// Mount `fs` at `mount_point`.
///
/// This function blocks until the filesystem is unmounted.
///
/// # Errors
///
/// Returns an error if the mount point is invalid or FUSE mounting fails.
pub fn mount<P: AsRef<Path>>(fs: ExecFs, mount_point: P, options: &MountOptions) -> io::Result<()> {
    attach(fs, mount_point, options)?.run()
}

/// Mount `fs` at `mount_point` without serving requests yet.
///
/// The mount exists once this returns; call `run` on the session to serve
/// it. Lets a caller report mount failures before it starts the request loop.
///
/// # Errors
///
/// Returns an error if the mount point is invalid or FUSE mounting fails.
pub fn attach<P: AsRef<Path>>(
    fs: ExecFs,
    mount_point: P,
    options: &MountOptions,
) -> io::Result<fuser::Session<ExecFuseFS>> {
    let mount_point = mount_point.as_ref();

    debug!(
        "Mounting {} at {} ({:?})",
        fs.root().display(),
        mount_point.display(),
        options
    );

    fuser::Session::new(ExecFuseFS::new(fs), mount_point, &options.to_fuser())
        .map_err(|e| io::Error::new(e.kind(), format!("FUSE mount failed: {}", e)))
}

/// Mount `fs` in the background and return a session handle.
///
/// The filesystem stays mounted until the returned `BackgroundSession` is
/// dropped or joined.
pub fn mount_background<P: AsRef<Path>>(
    fs: ExecFs,
    mount_point: P,
    options: &MountOptions,
) -> io::Result<fuser::BackgroundSession> {
    let mount_point = mount_point.as_ref();

    debug!(
        "Mounting {} at {} (background, {:?})",
        fs.root().display(),
        mount_point.display(),
        options
    );

    fuser::spawn_mount2(ExecFuseFS::new(fs), mount_point, &options.to_fuser())
        .map_err(|e| io::Error::new(e.kind(), format!("FUSE mount failed: {}", e)))
}
