//! Background mode for the mount binary.
//!
//! [`detach`] forks. The child starts a new session and performs the mount,
//! then reports the outcome through a pipe; the parent waits for that report
//! so it can exit with the mount's result instead of returning before the
//! mount was attempted.

use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};

const MOUNTED: u8 = 0;
const FAILED: u8 = 1;

/// Outcome of [`detach`], seen from each side of the fork.
#[derive(Debug)]
pub enum Detached {
    /// The invoking process. `mounted` is `true` only if the child reported
    /// a successful mount.
    Parent { child: libc::pid_t, mounted: bool },
    /// The background process, which must report through [`Readiness`].
    Child(Readiness),
}

/// Write end of the readiness pipe, held by the background process.
///
/// Dropping it without reporting counts as a failed mount.
#[derive(Debug)]
pub struct Readiness {
    pipe: File,
}

impl Readiness {
    /// Tell the parent the mount is in place.
    pub fn mounted(self) {
        self.report(MOUNTED);
    }

    /// Tell the parent the mount failed.
    pub fn failed(self) {
        self.report(FAILED);
    }

    fn report(mut self, status: u8) {
        if let Err(e) = self.pipe.write_all(&[status]) {
            debug!("readiness report lost: {}", e);
        }
    }
}

/// Fork into the background.
///
/// Must be called before any thread is started. In the child, the working
/// directory becomes `/` and stdin and stdout point to `/dev/null`; stderr is
/// kept so log output stays visible.
///
/// # Errors
///
/// Returns an error if the pipe or the fork cannot be created, or if the
/// child cannot set itself up (the parent then sees a failed mount).
pub fn detach() -> io::Result<Detached> {
    let (mut reader, writer) = pipe()?;

    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            drop(reader);
            into_background()?;
            Ok(Detached::Child(Readiness { pipe: writer }))
        }
        child => {
            drop(writer);
            let mut status = [FAILED];
            let mounted = loop {
                match reader.read(&mut status) {
                    Ok(1) => break status[0] == MOUNTED,
                    Ok(_) => break false,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break false,
                }
            };
            Ok(Detached::Parent { child, mounted })
        }
    }
}

fn into_background() -> io::Result<()> {
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    std::env::set_current_dir("/")?;

    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO] {
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 returned two fresh descriptors we now own.
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}
