//! # execfs-fs
//!
//! A filesystem in which opening a file runs it and reading returns what it
//! printed.
//!
//! This crate provides:
//! - Virtual path resolution, including arguments encoded in file names
//! - Attribute emulation for exec-on-open files
//! - A handle table binding each open to its own subprocess session
//! - [`ExecFs`]: the filesystem operations (lookup, getattr, readdir, open,
//!   read, write, flush, release)
//! - FUSE filesystem support (with the `fuse` feature)
//! - Background mode that reports the mount result to the invoking process
//!
//! ## Example
//!
//! ```ignore
//! use execfs_fs::{ExecFs, ExecFsConfig};
//! use std::path::Path;
//!
//! let fs = ExecFs::new(ExecFsConfig {
//!     backing_root: "/srv/reports".into(),
//!     ..Default::default()
//! })?;
//!
//! let handle = fs.open(Path::new("disk-usage?-h"), libc::O_RDONLY)?;
//! let bytes = fs.read(handle, 0, 4096)?;
//! fs.release(handle)?;
//! ```
//!
//! ## FUSE Support
//!
//! ```ignore
//! use execfs_fs::fuse::{mount, MountOptions};
//!
//! mount(fs, "/mnt/reports", &MountOptions::default())?;
//! ```

mod attr;
mod config;
pub mod detach;
mod error;
mod handles;
mod resolver;
mod vfs;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use attr::{AttributeSnapshot, NodeKind, SizePolicy};
pub use config::{ConfigFile, ExecFsConfig};
pub use error::{ConfigError, Fault};
pub use handles::{Handle, HandleTable, OpenFile};
pub use resolver::{
    DirEntry, Invocation, Resolver, Target, VirtualName, VirtualPath, ARGUMENT_SEPARATOR,
    INVOCATION_DELIMITER,
};
pub use vfs::{ExecFs, ENV_PATH, ENV_ROOT};

// Re-export runtime types for convenience
pub use execfs_runtime::{ReapPolicy, SessionConfig, StderrPolicy, StdinSource};
