use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while running a backing executable.
#[derive(Debug, Error)]
pub enum Error {
    /// The subprocess could not be started.
    #[error("exec failed for {path}: {source}")]
    Spawn {
        /// Backing executable that failed to start.
        path: PathBuf,
        /// Underlying error from the spawn primitive.
        #[source]
        source: std::io::Error,
    },

    /// A pipe to the subprocess could not be created.
    #[error("pipe error: {0}")]
    Pipe(std::io::Error),

    /// Signal delivery to the subprocess group failed.
    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        /// Process group the signal was sent to.
        pgid: i32,
        /// Underlying error from `kill(2)`.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for execfs-runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
