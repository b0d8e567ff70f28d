//! Termination of sessions whose handle is being released.

use crate::config::ReapPolicy;
use crate::error::Result;
use crate::session::ExecSession;
use log::{debug, warn};
use std::process::ExitStatus;

/// Bring `session`'s program to an end and finalize its output.
///
/// Standard input is closed first. The program then gets
/// [`ReapPolicy::exit_grace`] to exit by itself, after which its process
/// group receives SIGTERM and, if still alive after
/// [`ReapPolicy::kill_grace`], SIGKILL. The session is finalized on every
/// path, including errors, and the program is always reaped unless the final
/// blocking wait itself fails.
pub fn reap(session: &ExecSession, policy: &ReapPolicy) -> Result<ExitStatus> {
    let result = terminate(session, policy);
    session.finalize();
    result
}

fn terminate(session: &ExecSession, policy: &ReapPolicy) -> Result<ExitStatus> {
    session.close_input();

    if let Some(status) = session.wait_exit(policy.exit_grace)? {
        debug!("pid {}: exited on its own ({})", session.pid(), status);
        return Ok(status);
    }

    match session.signal(libc::SIGTERM) {
        Ok(true) => {
            if let Some(status) = session.wait_exit(policy.kill_grace)? {
                debug!("pid {}: terminated ({})", session.pid(), status);
                return Ok(status);
            }
            warn!(
                "pid {}: still running {:?} after SIGTERM, killing",
                session.pid(),
                policy.kill_grace
            );
        }
        Ok(false) => {}
        Err(e) => warn!("pid {}: {}", session.pid(), e),
    }

    session.kill()
}
