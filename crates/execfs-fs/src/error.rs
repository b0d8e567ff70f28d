use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Faults returned by filesystem operations.
///
/// Every variant maps to a single errno through [`Fault::errno`]; nothing in
/// this crate turns a fault into a process abort.
#[derive(Debug, Error)]
pub enum Fault {
    /// The virtual path does not exist.
    #[error("not found")]
    NotFound,

    /// The path exists but the operation is not allowed on it.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed request, such as a bad argument encoding.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A file operation was attempted on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// A directory operation was attempted on a file.
    #[error("not a directory")]
    NotDirectory,

    /// Modification attempted on a read-only mount.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Unknown file handle.
    #[error("bad file handle {0}")]
    BadHandle(u64),

    /// The backing program could not be run.
    #[error("exec failed: {0}")]
    Exec(#[from] execfs_runtime::Error),

    /// I/O error against the backing tree.
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl Fault {
    /// The errno reported to the filesystem caller.
    pub fn errno(&self) -> i32 {
        match self {
            Fault::NotFound => libc::ENOENT,
            Fault::PermissionDenied(_) => libc::EACCES,
            Fault::InvalidArgument(_) => libc::EINVAL,
            Fault::IsDirectory => libc::EISDIR,
            Fault::NotDirectory => libc::ENOTDIR,
            Fault::ReadOnly => libc::EROFS,
            Fault::BadHandle(_) => libc::EBADF,
            Fault::Exec(_) => libc::EIO,
            Fault::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<io::Error> for Fault {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Fault::NotFound,
            io::ErrorKind::PermissionDenied => Fault::PermissionDenied(e.to_string()),
            _ if e.raw_os_error() == Some(libc::ENOTDIR) => Fault::NotFound,
            _ => Fault::Io(e),
        }
    }
}

/// Errors from loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML for this configuration.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
