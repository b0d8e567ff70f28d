use crate::attr::AttributeSnapshot;
use crate::config::ExecFsConfig;
use crate::error::Fault;
use crate::handles::{Handle, HandleTable, OpenFile};
use crate::resolver::{DirEntry, Resolver, Target, VirtualPath};
use execfs_runtime::{reap, ExecRequest, ExecSession, StdinSource};
use log::{debug, info, trace, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

/// Exported to every program: the backing root directory.
pub const ENV_ROOT: &str = "EXECFS_ROOT";

/// Exported to every program: the virtual path it was opened through.
pub const ENV_PATH: &str = "EXECFS_PATH";

/// Filesystem operations of an exec-on-open tree.
///
/// Paths are virtual paths relative to the mount root (a leading `/` is
/// accepted). Every method takes `&self` and is safe to call from several
/// dispatcher threads at once.
#[derive(Debug)]
pub struct ExecFs {
    config: ExecFsConfig,
    resolver: Resolver,
    handles: HandleTable,
}

impl ExecFs {
    /// Create the filesystem over `config.backing_root`.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::NotFound`] or [`Fault::NotDirectory`] if the backing
    /// root is missing or not a directory.
    pub fn new(mut config: ExecFsConfig) -> Result<Self, Fault> {
        let root = fs::canonicalize(&config.backing_root)?;
        if !root.is_dir() {
            return Err(Fault::NotDirectory);
        }
        config.backing_root = root.clone();

        debug!("Backing root: {}", root.display());
        let resolver = Resolver::new(root, config.hide_non_executable);
        Ok(Self {
            config,
            resolver,
            handles: HandleTable::new(),
        })
    }

    pub fn config(&self) -> &ExecFsConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Attributes of a path; never runs anything.
    pub fn lookup(&self, path: &Path) -> Result<AttributeSnapshot, Fault> {
        self.getattr(path, None)
    }

    /// Attributes of a path, sized from `handle`'s output if one is given.
    pub fn getattr(
        &self,
        path: &Path,
        handle: Option<Handle>,
    ) -> Result<AttributeSnapshot, Fault> {
        let target = self.resolver.resolve(path)?;
        let output_len = handle
            .and_then(|h| self.handles.lookup(h))
            .map(|file| file.session.len() as u64);
        AttributeSnapshot::of(&target, self.config.size_policy, output_len)
    }

    /// Entries of a virtual directory.
    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>, Fault> {
        self.resolver.list(path)
    }

    /// Start the program behind `path` and return a handle to its output.
    ///
    /// `flags` are the `open(2)` flags; write access connects the handle to
    /// the program's stdin unless the name selects a null stdin.
    pub fn open(&self, path: &Path, flags: i32) -> Result<Handle, Fault> {
        let vpath = match self.resolver.resolve(path)? {
            Target::Executable(vpath) => vpath,
            Target::Directory(_) => return Err(Fault::IsDirectory),
            Target::Plain(backing) => {
                return Err(Fault::PermissionDenied(format!(
                    "{} is not executable",
                    backing.display()
                )));
            }
        };

        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        if writable && self.config.read_only {
            return Err(Fault::ReadOnly);
        }

        let request = self.exec_request(&vpath, writable);
        let session = ExecSession::spawn(&request, &self.config.session)?;
        let pid = session.pid();
        let handle = self.handles.register(OpenFile {
            session,
            path: vpath,
            writable,
        });

        debug!(
            "open({}) -> handle {} (pid={}, writable={})",
            path.display(),
            handle,
            pid,
            writable
        );
        Ok(handle)
    }

    /// Output bytes at `offset`, at most `size`. Never waits for the program.
    pub fn read(&self, handle: Handle, offset: u64, size: usize) -> Result<Vec<u8>, Fault> {
        let file = self.file(handle)?;
        Ok(file.session.read(offset, size))
    }

    /// Like [`ExecFs::read`], but first waits up to `timeout` for the range to
    /// be produced or for the program to finish.
    pub fn read_wait(
        &self,
        handle: Handle,
        offset: u64,
        size: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Fault> {
        let file = self.file(handle)?;
        let want = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .saturating_add(size);
        if !file.session.wait_for_output(want, timeout) {
            trace!("read_wait: handle {} timed out after {:?}", handle, timeout);
        }
        Ok(file.session.read(offset, size))
    }

    /// Forward `data` to the program's stdin. The offset is ignored.
    ///
    /// Writes after the program stopped reading are accepted and dropped.
    pub fn write(&self, handle: Handle, offset: u64, data: &[u8]) -> Result<usize, Fault> {
        let file = self.file(handle)?;
        if !file.writable {
            return Err(Fault::PermissionDenied(format!(
                "handle {} is not open for writing",
                handle
            )));
        }

        let forwarded = file.session.write_input(data)?;
        if forwarded < data.len() {
            trace!(
                "write: handle {} dropped {} bytes at offset {}",
                handle,
                data.len() - forwarded,
                offset
            );
        }
        Ok(data.len())
    }

    /// Close the program's stdin.
    pub fn flush(&self, handle: Handle) -> Result<(), Fault> {
        self.file(handle)?.session.close_input();
        Ok(())
    }

    /// Close `handle`: end its program and drop its output.
    pub fn release(&self, handle: Handle) -> Result<ExitStatus, Fault> {
        let file = self.handles.remove(handle).ok_or(Fault::BadHandle(handle))?;
        let status = reap(&file.session, &self.config.reap)?;
        info!(
            "{} (pid {}) finished with {} after {} bytes",
            file.path.relative.display(),
            file.session.pid(),
            status,
            file.session.len()
        );
        Ok(status)
    }

    /// Exit status of `handle`'s program, once it has exited.
    pub fn exit_status(&self, handle: Handle) -> Result<Option<ExitStatus>, Fault> {
        Ok(self.file(handle)?.session.exit_status())
    }

    /// Process id of `handle`'s program.
    pub fn pid(&self, handle: Handle) -> Result<u32, Fault> {
        Ok(self.file(handle)?.session.pid())
    }

    /// Whether `handle`'s output is final.
    pub fn is_complete(&self, handle: Handle) -> Result<bool, Fault> {
        Ok(self.file(handle)?.session.is_complete())
    }

    /// Apply permission bits to the backing file of `path`.
    ///
    /// For executables the virtual view is recomputed from the new mode, so
    /// clearing every execute bit turns the file into a plain one.
    pub fn set_mode(&self, path: &Path, mode: u32) -> Result<AttributeSnapshot, Fault> {
        if self.config.read_only {
            return Err(Fault::ReadOnly);
        }
        let target = self.resolver.resolve(path)?;
        fs::set_permissions(target.backing(), fs::Permissions::from_mode(mode & 0o7777))?;
        debug!("chmod {:o} {}", mode & 0o7777, target.backing().display());
        self.lookup(path)
    }

    /// Reap every open handle. Called on unmount.
    pub fn shutdown(&self) {
        for (handle, file) in self.handles.take_all() {
            debug!("shutdown: reaping handle {}", handle);
            if let Err(e) = reap(&file.session, &self.config.reap) {
                warn!("shutdown: handle {}: {}", handle, e);
            }
        }
    }

    fn file(&self, handle: Handle) -> Result<Arc<OpenFile>, Fault> {
        self.handles.lookup(handle).ok_or(Fault::BadHandle(handle))
    }

    fn exec_request(&self, vpath: &VirtualPath, writable: bool) -> ExecRequest {
        let stdin = match vpath.stdin {
            Some(source) => source,
            None if writable => StdinSource::Pipe,
            None => StdinSource::Null,
        };

        let mut request = ExecRequest::new(&vpath.backing)
            .args(vpath.args.iter().flatten())
            .stdin(stdin)
            .env(ENV_ROOT, self.root())
            .env(ENV_PATH, Path::new("/").join(&vpath.relative));
        if let Some(dir) = vpath.backing.parent() {
            request = request.current_dir(PathBuf::from(dir));
        }
        request
    }
}

impl Drop for ExecFs {
    fn drop(&mut self) {
        self.shutdown();
    }
}
