//! # execfs-runtime
//!
//! Subprocess side of execfs: running a backing executable for one open file
//! handle and turning its output stream into a readable buffer.
//!
//! This crate provides:
//! - [`ExecSession`]: spawn, background output draining, stdin forwarding
//! - [`reap`]: graceful then forced termination on release
//! - Spawn and reap policies ([`SessionConfig`], [`ReapPolicy`])
//!
//! ## Example
//!
//! ```ignore
//! use execfs_runtime::{reap, ExecRequest, ExecSession, ReapPolicy, SessionConfig};
//! use std::time::Duration;
//!
//! let request = ExecRequest::new("/usr/bin/uptime");
//! let session = ExecSession::spawn(&request, &SessionConfig::default())?;
//! session.wait_complete(Duration::from_secs(1));
//! println!("{}", String::from_utf8_lossy(&session.read(0, 4096)));
//! reap(&session, &ReapPolicy::default())?;
//! ```

mod config;
mod error;
mod reaper;
mod session;

pub use config::{ReapPolicy, SessionConfig, StderrPolicy, StdinSource};
pub use error::{Error, Result};
pub use reaper::reap;
pub use session::{ExecRequest, ExecSession};
