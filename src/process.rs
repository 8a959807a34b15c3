//! Child process lifecycle: spawn with piped stdio, wait, and forceful teardown.

use crate::command::Command;
use crate::error::RunError;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdout};

/// A running (or exited, not yet discarded) child.
///
/// Every exit path must end in `terminate()` followed by `wait()` so the
/// child is reaped. `kill_on_drop` is only a last resort.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    returncode: Option<i32>,
}

/// Spawn `command`. With `capture` set, stdout and stderr are piped and must
/// be taken with [`ProcessHandle::take_pipes`].
pub fn launch(command: &Command, capture: bool) -> Result<ProcessHandle, RunError> {
    let mut child = command
        .to_tokio(capture)
        .spawn()
        .map_err(|e| RunError::Spawn {
            program: command.program.clone(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    tracing::debug!(pid, command = %command, capture, "child process started");

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), command.input.clone()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                // The child may exit without reading its input.
                tracing::debug!(pid, error = %e, "failed to write child stdin");
            }
        });
    }

    Ok(ProcessHandle {
        child,
        pid,
        returncode: None,
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Read ends of the child's stdout and stderr. `None` if the child was
    /// launched without capture or the pipes were already taken.
    pub fn take_pipes(&mut self) -> Option<(ChildStdout, ChildStderr)> {
        match (self.child.stdout.take(), self.child.stderr.take()) {
            (Some(out), Some(err)) => Some((out, err)),
            _ => None,
        }
    }

    /// Wait for the child to exit and reap it. Cancel-safe; repeated calls
    /// return the cached return code.
    pub async fn wait(&mut self) -> Result<i32, RunError> {
        if let Some(code) = self.returncode {
            return Ok(code);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RunError::Io { source: e })?;
        let code = returncode(status);
        tracing::debug!(pid = self.pid, returncode = code, "child process reaped");
        self.returncode = Some(code);
        Ok(code)
    }

    /// SIGKILL the child's process group. Idempotent; a child that already
    /// exited is not an error.
    pub fn terminate(&mut self) {
        // `id()` is `None` once tokio has reaped the child, after which the
        // pid may belong to someone else.
        let Some(pid) = self.child.id() else {
            return;
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pid, "sent SIGKILL to process group"),
            Err(Errno::ESRCH) => tracing::debug!(pid, "process group already gone"),
            Err(e) => {
                tracing::warn!(pid, error = %e, "killpg failed, killing child directly");
                if let Err(e) = self.child.start_kill() {
                    tracing::debug!(pid, error = %e, "child already exited");
                }
            }
        }
    }

    /// Terminate and reap in one step.
    pub async fn terminate_and_wait(&mut self) -> Result<i32, RunError> {
        self.terminate();
        self.wait().await
    }
}

/// Exit code, or `-signal` for a child killed by a signal.
fn returncode(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}
