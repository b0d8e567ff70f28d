use crate::config::{SessionConfig, StderrPolicy, StdinSource};
use crate::error::{Error, Result};
use log::{debug, trace, warn};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Size of a single read from the output pipe.
const DRAIN_CHUNK: usize = 64 * 1024;

/// Upper bound for the interval between exit polls.
const EXIT_POLL_MAX: Duration = Duration::from_millis(20);

/// Description of one program invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Backing executable, executed directly without a shell.
    pub program: PathBuf,
    /// Arguments passed after the program name.
    pub args: Vec<OsString>,
    /// Standard input source.
    pub stdin: StdinSource,
    /// Working directory of the subprocess.
    pub current_dir: Option<PathBuf>,
    /// Extra environment variables on top of the inherited environment.
    pub env: Vec<(OsString, OsString)>,
}

impl ExecRequest {
    /// Create a request for `program` with no arguments and a null stdin.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: StdinSource::Null,
            current_dir: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Default)]
struct SessionState {
    /// Bytes appended so far; mirrors the buffer length for condvar waiters.
    produced: usize,
    /// The output pipe reached end-of-file.
    output_closed: bool,
    exit_status: Option<ExitStatus>,
    /// No further appends are accepted.
    finalized: bool,
}

/// One execution of a backing program bound to one open file handle.
///
/// The output buffer is filled by a dedicated drain thread and read by any
/// number of callers. Appends happen under the buffer's write lock, so a
/// reader always sees a complete prefix of what the program emitted.
pub struct ExecSession {
    program: PathBuf,
    pid: u32,
    created: SystemTime,
    output: RwLock<Vec<u8>>,
    state: Mutex<SessionState>,
    changed: Condvar,
    /// Shared so a write can proceed without holding the lock; the pipe
    /// closes once the last clone is dropped.
    stdin: Mutex<Option<Arc<ChildStdin>>>,
    child: Mutex<Child>,
}

impl ExecSession {
    /// Spawn the program described by `request` and start draining its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the program cannot be started (missing
    /// interpreter, permission denied, resource exhaustion) and
    /// [`Error::Pipe`] if the output pipe cannot be created.
    pub fn spawn(request: &ExecRequest, config: &SessionConfig) -> Result<Arc<Self>> {
        let (mut child, reader) = start(request, config)?;
        let stdin = child.stdin.take().map(Arc::new);
        let pid = child.id();

        let session = Arc::new(Self {
            program: request.program.clone(),
            pid,
            created: SystemTime::now(),
            output: RwLock::new(Vec::new()),
            state: Mutex::new(SessionState::default()),
            changed: Condvar::new(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
        });

        debug!(
            "Spawned {} (pid={}, args={:?}, stdin={:?})",
            request.program.display(),
            pid,
            request.args,
            request.stdin
        );

        // If the thread cannot be started the session is dropped here, which
        // kills and reaps the child.
        let drainer = Arc::clone(&session);
        thread::Builder::new()
            .name(format!("execfs-drain-{}", pid))
            .spawn(move || drainer.drain(reader))?;

        Ok(session)
    }

    /// Process id of the subprocess, also its process group id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Backing program this session runs.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// When the session was created.
    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Number of output bytes currently available.
    pub fn len(&self) -> usize {
        read_lock(&self.output).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the output is final: either the program exited and its output
    /// was fully drained, or the session was finalized by the reaper.
    pub fn is_complete(&self) -> bool {
        lock(&self.state).finalized
    }

    /// Exit status, once the program has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        lock(&self.state).exit_status
    }

    /// Whether writes are still forwarded to the program.
    pub fn is_input_open(&self) -> bool {
        lock(&self.stdin).is_some()
    }

    /// Copy up to `size` bytes of output starting at `offset`.
    ///
    /// Never blocks on the program. Returns only what is available; an offset
    /// at or past the current end yields an empty vector.
    pub fn read(&self, offset: u64, size: usize) -> Vec<u8> {
        let output = read_lock(&self.output);
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(output.len());
        let end = start.saturating_add(size).min(output.len());
        output[start..end].to_vec()
    }

    /// Wait until at least `len` output bytes exist or the output is final.
    ///
    /// Returns `true` if the condition was met before `timeout` elapsed.
    pub fn wait_for_output(&self, len: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.produced >= len || state.finalized {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Wait until the output is final, returning the exit status if known.
    pub fn wait_complete(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while !state.finalized {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        state.exit_status
    }

    /// Forward `bytes` to the program's standard input.
    ///
    /// Returns the number of bytes forwarded. Once the input is closed or the
    /// program stopped reading, bytes are discarded and `Ok(0)` is returned.
    ///
    /// The write may block on a full pipe, but it never holds a lock while
    /// doing so: [`ExecSession::close_input`] and the reaper can run
    /// concurrently, and a write blocked on a program that gets killed fails
    /// with a broken pipe.
    pub fn write_input(&self, bytes: &[u8]) -> Result<usize> {
        let Some(pipe) = lock(&self.stdin).clone() else {
            trace!("pid {}: input closed, discarding {} bytes", self.pid, bytes.len());
            return Ok(0);
        };

        match (&*pipe).write_all(bytes) {
            Ok(()) => Ok(bytes.len()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("pid {}: program stopped reading input", self.pid);
                lock(&self.stdin).take();
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the program's standard input. Returns `true` if it was open.
    pub fn close_input(&self) -> bool {
        let closed = lock(&self.stdin).take().is_some();
        if closed {
            trace!("pid {}: input closed", self.pid);
        }
        closed
    }

    /// Check whether the program exited, reaping it if so.
    pub fn poll_exit(&self) -> Result<Option<ExitStatus>> {
        let status = lock(&self.child).try_wait()?;
        if let Some(status) = status {
            self.record_exit(status);
        }
        Ok(status)
    }

    /// Poll for program exit until `timeout` elapses.
    pub fn wait_exit(&self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(1);
        loop {
            if let Some(status) = self.poll_exit()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(delay.min(deadline - now));
            delay = (delay * 2).min(EXIT_POLL_MAX);
        }
    }

    /// Send `signal` to the program's process group.
    ///
    /// Returns `false` without signalling if the program was already reaped.
    pub fn signal(&self, signal: libc::c_int) -> Result<bool> {
        let mut child = lock(&self.child);
        if let Some(status) = child.try_wait()? {
            drop(child);
            self.record_exit(status);
            return Ok(false);
        }

        // The child is unreaped while we hold its lock, so the pid cannot
        // have been recycled.
        let pgid = self.pid as i32;
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(false);
            }
            return Err(Error::Signal { pgid, source: err });
        }
        trace!("pid {}: sent signal {} to group", self.pid, signal);
        Ok(true)
    }

    /// SIGKILL the process group and block until the program is reaped.
    pub fn kill(&self) -> Result<ExitStatus> {
        let mut child = lock(&self.child);
        if let Some(status) = child.try_wait()? {
            drop(child);
            self.record_exit(status);
            return Ok(status);
        }

        let pgid = self.pid as i32;
        if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
            let err = io::Error::last_os_error();
            warn!("pid {}: SIGKILL to group failed: {}", self.pid, err);
            child.kill()?;
        }
        let status = child.wait()?;
        drop(child);
        self.record_exit(status);
        Ok(status)
    }

    /// Make the output immutable. Idempotent.
    pub fn finalize(&self) {
        self.close_input();
        let mut state = lock(&self.state);
        if !state.finalized {
            state.finalized = true;
            debug!(
                "pid {}: finalized with {} bytes (exit={:?})",
                self.pid, state.produced, state.exit_status
            );
        }
        drop(state);
        self.changed.notify_all();
    }

    fn drain(&self, mut reader: File) {
        let mut chunk = vec![0u8; DRAIN_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if !self.append(&chunk[..n]) {
                        trace!("pid {}: finalized, drain stops", self.pid);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("pid {}: output read failed: {}", self.pid, e);
                    break;
                }
            }
        }
        drop(reader);

        {
            let mut state = lock(&self.state);
            state.output_closed = true;
        }
        self.changed.notify_all();
        trace!("pid {}: output closed", self.pid);

        let mut delay = Duration::from_millis(1);
        loop {
            if lock(&self.state).exit_status.is_some() {
                break;
            }
            match self.poll_exit() {
                Ok(Some(_)) => break,
                Ok(None) => {}
                Err(e) => {
                    warn!("pid {}: wait failed: {}", self.pid, e);
                    break;
                }
            }
            thread::sleep(delay);
            delay = (delay * 2).min(EXIT_POLL_MAX);
        }
        self.finalize();
    }

    /// Append a chunk unless the session is finalized.
    fn append(&self, bytes: &[u8]) -> bool {
        let mut state = lock(&self.state);
        if state.finalized {
            return false;
        }
        let mut output = write_lock(&self.output);
        output.extend_from_slice(bytes);
        state.produced = output.len();
        drop(output);
        drop(state);
        self.changed.notify_all();
        true
    }

    fn record_exit(&self, status: ExitStatus) {
        let mut state = lock(&self.state);
        if state.exit_status.is_none() {
            debug!("pid {}: exited with {}", self.pid, status);
            state.exit_status = Some(status);
        }
        drop(state);
        self.changed.notify_all();
    }
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("len", &self.len())
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Ok(None) = child.try_wait() {
            warn!("pid {}: session dropped while running, killing", self.pid);
            unsafe {
                libc::kill(-(self.pid as i32), libc::SIGKILL);
            }
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn start(request: &ExecRequest, config: &SessionConfig) -> Result<(Child, File)> {
    let (reader, writer) = pipe().map_err(Error::Pipe)?;

    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .envs(request.env.iter().map(|(k, v)| (k, v)))
        .process_group(0);

    if let Some(dir) = &request.current_dir {
        command.current_dir(dir);
    }

    command.stdin(match request.stdin {
        StdinSource::Pipe => Stdio::piped(),
        StdinSource::Null => Stdio::null(),
    });

    match config.stderr {
        StderrPolicy::Merge => {
            let err = writer.try_clone().map_err(Error::Pipe)?;
            command.stderr(Stdio::from(err));
        }
        StderrPolicy::Discard => {
            command.stderr(Stdio::null());
        }
    }
    command.stdout(Stdio::from(writer));

    let child = command.spawn().map_err(|source| Error::Spawn {
        path: request.program.clone(),
        source,
    })?;

    // The command owns our copies of the write end; they must be closed for
    // the drain thread to ever see end-of-file.
    drop(command);

    Ok((child, reader))
}

fn pipe() -> io::Result<(File, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let reader = unsafe { File::from_raw_fd(fds[0]) };
    let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((reader, writer))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
