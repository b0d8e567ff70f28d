use serde::Deserialize;
use std::time::Duration;

/// Where the subprocess's standard error ends up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrPolicy {
    /// Standard error shares the output pipe with standard output.
    #[default]
    Merge,
    /// Standard error is connected to the null device.
    Discard,
}

/// Source of the subprocess's standard input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdinSource {
    /// A pipe owned by the session; writes on the handle are forwarded to it.
    Pipe,
    /// The null device; the program sees end-of-input immediately.
    #[default]
    Null,
}

/// Spawn-time settings shared by every session of a mount.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Standard error handling.
    pub stderr: StderrPolicy,
}

/// Grace periods used when a session is released while its program still runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// How long to wait for a natural exit after standard input is closed.
    pub exit_grace: Duration,
    /// How long to wait after SIGTERM before sending SIGKILL.
    pub kill_grace: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            exit_grace: Duration::ZERO,
            kill_grace: Duration::from_millis(100),
        }
    }
}
