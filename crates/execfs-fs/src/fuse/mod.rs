//! FUSE filesystem adapter for execfs.
//!
//! Translates inode-based FUSE requests into path-based [`ExecFs`]
//! operations and faults into errno replies.
//!
//! # Features
//!
//! - **Direct I/O**: opened files bypass the page cache, so reads are not
//!   clamped to the placeholder size reported by `getattr`
//! - **Inodes on demand**: only paths that resolve get an inode, and it is
//!   released again when the kernel forgets it
//! - **Cleanup on unmount**: still-open programs are reaped in `destroy`
//!
//! # Example
//!
//! ```ignore
//! use execfs_fs::fuse::{mount, MountOptions};
//! use execfs_fs::{ExecFs, ExecFsConfig};
//!
//! let fs = ExecFs::new(ExecFsConfig::default())?;
//! mount(fs, "/mnt/exec", &MountOptions::default())?;
//! ```
//!
//! [`ExecFs`]: crate::ExecFs

mod adapter;
mod inodes;

pub use adapter::*;
