//! Runs one child process to completion or to a deadline.
//!
//! The runner races the child's exit against the earliest deadline from the
//! `TimeoutArbiter`, feeding it every line event from the two stream readers.
//! On expiry the child's process group is killed, the readers are drained of
//! whatever the child already wrote, and a `TimeoutFailure` is returned.

use crate::arbiter::TimeoutArbiter;
use crate::command::Command;
use crate::decode::LineDecoder;
use crate::error::RunError;
use crate::outcome::{Captured, RunResult, TimeoutFailure, TimeoutKind};
use crate::policy::{CaptureMode, DecodeErrors, TimeoutPolicy};
use crate::process::{self, ProcessHandle};
use crate::reader::{CapturedStream, StreamEvent, StreamId, StreamReader};
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default time allowed for readers to reach end-of-stream once the child is gone.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything that shapes a run besides the command itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub policy: TimeoutPolicy,
    pub capture: CaptureMode,
    /// Turn a non-zero return code into `RunError::NonZeroExit`.
    pub check: bool,
    pub drain_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            policy: TimeoutPolicy::default(),
            capture: CaptureMode::default(),
            check: false,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl RunOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy = self.policy.with_timeout(timeout);
        self
    }

    pub fn log_timeout(mut self, log_timeout: Duration) -> Self {
        self.policy = self.policy.with_log_timeout(log_timeout);
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture.capture_output = capture;
        self
    }

    pub fn text(mut self, text: bool) -> Self {
        self.capture.text = text;
        self
    }

    pub fn encoding(mut self, label: impl Into<String>, errors: DecodeErrors) -> Self {
        self.capture = self.capture.encoding(label, errors);
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }
}

/// Run a command given as a full argv.
pub async fn run_argv<I, S>(argv: I, options: &RunOptions) -> Result<RunResult, RunError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let command = Command::from_argv(argv).ok_or_else(|| RunError::Spawn {
        program: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
    })?;
    run(&command, options).await
}

/// Run `command` under `options`.
///
/// Returns `Ok` whenever the child exits on its own (unless `check` rejects
/// its return code). Deadline expiry, spawn failure and strict decode
/// failure are reported as distinct `RunError` variants. Exactly one
/// execution attempt is made.
pub async fn run(command: &Command, options: &RunOptions) -> Result<RunResult, RunError> {
    let decoder = options.capture.decoder()?;
    let capture = options.capture.is_active(&options.policy);

    let started_at = Instant::now();
    let mut process = process::launch(command, capture)?;
    let mut arbiter = TimeoutArbiter::new(options.policy, started_at);

    tracing::info!(
        pid = process.pid(),
        command = %command,
        timeout_secs = ?options.policy.timeout().map(|d| d.as_secs_f64()),
        log_timeout_secs = ?options.policy.log_timeout().map(|d| d.as_secs_f64()),
        capture,
        "running command"
    );

    let mut readers = process
        .take_pipes()
        .map(|(stdout, stderr)| Readers::start(stdout, stderr, decoder));

    let decision = race(&mut process, &mut arbiter, readers.as_mut()).await;
    let elapsed = started_at.elapsed();

    match decision {
        Decision::Exited(Ok(returncode)) => {
            tracing::info!(
                pid = process.pid(),
                returncode,
                duration_secs = elapsed.as_secs_f64(),
                "command exited"
            );
            let collected = collect(readers, options.drain_grace).await?;
            if let Some(failure) = collected.failure {
                return Err(failure);
            }
            if options.check && returncode != 0 {
                return Err(RunError::NonZeroExit {
                    cmd: command.argv(),
                    returncode,
                    stdout: collected.stdout,
                    stderr: collected.stderr,
                });
            }
            Ok(RunResult {
                returncode,
                stdout: collected.stdout,
                stderr: collected.stderr,
            })
        }
        Decision::Exited(Err(e)) => {
            teardown(&mut process).await;
            let _ = collect(readers, options.drain_grace).await;
            Err(e)
        }
        Decision::TimedOut(kind) => {
            let timeout = arbiter.configured(kind);
            tracing::warn!(
                pid = process.pid(),
                kind = %kind,
                timeout_secs = timeout.as_secs_f64(),
                duration_secs = elapsed.as_secs_f64(),
                "deadline expired, killing command"
            );
            teardown(&mut process).await;
            let collected = collect(readers, options.drain_grace).await?;
            // The outcome is already decided; a stream that failed while
            // draining only loses strictness, never the timeout.
            if let Some(failure) = collected.failure {
                tracing::warn!(error = %failure, "stream failed after deadline expired");
            }
            Err(RunError::Timeout(TimeoutFailure {
                kind,
                cmd: command.argv(),
                timeout,
                stdout: collected.stdout,
                stderr: collected.stderr,
            }))
        }
        Decision::DecodeFailed {
            stream,
            offset,
            encoding,
        } => {
            tracing::warn!(
                pid = process.pid(),
                stream = %stream,
                offset,
                encoding,
                "undecodable output, killing command"
            );
            teardown(&mut process).await;
            let _ = collect(readers, options.drain_grace).await;
            Err(RunError::Decode {
                stream,
                offset,
                encoding,
            })
        }
    }
}

enum Decision {
    Exited(Result<i32, RunError>),
    TimedOut(TimeoutKind),
    DecodeFailed {
        stream: StreamId,
        offset: u64,
        encoding: &'static str,
    },
}

/// Wait for the first of: child exit, a deadline, a decode failure.
///
/// Line events are handled before anything else so a line that arrived
/// before a deadline still resets it. Exit beats a deadline that expires
/// in the same poll.
async fn race(
    process: &mut ProcessHandle,
    arbiter: &mut TimeoutArbiter,
    mut readers: Option<&mut Readers>,
) -> Decision {
    let mut events_open = readers.is_some();
    loop {
        let deadline = arbiter.next_deadline();
        tokio::select! {
            biased;
            event = next_event(readers.as_deref_mut()), if events_open => match event {
                Some(StreamEvent::Line { stream, at }) => {
                    tracing::trace!(stream = %stream, "line captured");
                    arbiter.record_activity(at);
                    // A chatty child must not starve the absolute deadline.
                    if let Some(kind) = arbiter.classify(Instant::now()) {
                        return Decision::TimedOut(kind);
                    }
                }
                Some(StreamEvent::DecodeFailed { stream, offset, encoding }) => {
                    return Decision::DecodeFailed { stream, offset, encoding };
                }
                None => events_open = false,
            },
            returncode = process.wait() => return Decision::Exited(returncode),
            _ = sleep_until(deadline) => {
                if let Some(kind) = arbiter.classify(Instant::now()) {
                    return Decision::TimedOut(kind);
                }
            }
        }
    }
}

async fn next_event(readers: Option<&mut Readers>) -> Option<StreamEvent> {
    match readers {
        Some(readers) => readers.events.recv().await,
        None => None,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Kill and reap. A reap failure is logged; the run outcome is already decided.
async fn teardown(process: &mut ProcessHandle) {
    if let Err(e) = process.terminate_and_wait().await {
        tracing::warn!(pid = process.pid(), error = %e, "failed to reap killed command");
    }
}

/// The two reader tasks and the channels connecting them to the runner.
struct Readers {
    stdout: JoinHandle<CapturedStream>,
    stderr: JoinHandle<CapturedStream>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: watch::Sender<bool>,
}

impl Readers {
    fn start(
        stdout: ChildStdout,
        stderr: ChildStderr,
        decoder: Option<LineDecoder>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let stdout = StreamReader::new(
            StreamId::Stdout,
            stdout,
            decoder,
            events_tx.clone(),
            cancel_rx.clone(),
        )
        .spawn();
        let stderr =
            StreamReader::new(StreamId::Stderr, stderr, decoder, events_tx, cancel_rx).spawn();
        Self {
            stdout,
            stderr,
            events,
            cancel,
        }
    }
}

/// Output of both readers once joined. `failure` is the first stream
/// failure (decode or read error), stdout first.
#[derive(Debug, Default)]
struct Collected {
    stdout: Option<Captured>,
    stderr: Option<Captured>,
    failure: Option<RunError>,
}

/// Join both readers, cancelling any still running once `grace` has passed.
/// Joining is what makes the captured buffers safe to read.
async fn collect(readers: Option<Readers>, grace: Duration) -> Result<Collected, RunError> {
    let Some(mut readers) = readers else {
        return Ok(Collected::default());
    };
    let deadline = Instant::now() + grace;
    let stdout = join_reader(&mut readers.stdout, deadline, &readers.cancel).await;
    let stderr = join_reader(&mut readers.stderr, deadline, &readers.cancel).await;
    let (stdout, stdout_failure) = stdout?.into_parts();
    let (stderr, stderr_failure) = stderr?.into_parts();
    Ok(Collected {
        stdout: Some(stdout),
        stderr: Some(stderr),
        failure: stdout_failure.or(stderr_failure),
    })
}

async fn join_reader(
    handle: &mut JoinHandle<CapturedStream>,
    deadline: Instant,
    cancel: &watch::Sender<bool>,
) -> Result<CapturedStream, RunError> {
    let joined = match tokio::time::timeout_at(deadline, &mut *handle).await {
        Ok(joined) => joined,
        Err(_) => {
            tracing::warn!("output pipe still open after drain grace, cancelling reader");
            cancel.send_replace(true);
            handle.await
        }
    };
    joined.map_err(|e| RunError::Io {
        source: std::io::Error::other(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        Command::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_uncaptured_run_has_no_output() {
        let result = run(&sh("exit 3"), &RunOptions::default()).await.unwrap();
        assert_eq!(result.returncode, 3);
        assert_eq!(result.stdout, None);
        assert_eq!(result.stderr, None);
    }

    #[tokio::test]
    async fn test_capture_collects_both_streams() {
        let options = RunOptions::default().capture_output(true);
        let result = run(&sh("echo out; echo err >&2"), &options).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.unwrap().as_bytes(), b"out\n");
        assert_eq!(result.stderr.unwrap().as_bytes(), b"err\n");
    }

    #[tokio::test]
    async fn test_log_timeout_forces_capture() {
        let options = RunOptions::default().log_timeout(Duration::from_secs(5));
        let result = run(&sh("echo hi"), &options).await.unwrap();
        assert_eq!(result.stdout, Some(Captured::Bytes(b"hi\n".to_vec())));
        assert_eq!(result.stderr, Some(Captured::Bytes(Vec::new())));
    }

    #[tokio::test]
    async fn test_text_mode_returns_strings() {
        let options = RunOptions::default().capture_output(true).text(true);
        let result = run(&sh("printf 'a\\nb'"), &options).await.unwrap();
        assert_eq!(result.stdout, Some(Captured::Text("a\nb".to_string())));
    }

    #[tokio::test]
    async fn test_absolute_timeout_without_capture() {
        let options = RunOptions::default().timeout(Duration::from_millis(200));
        let err = run(&Command::new("sleep").arg("5"), &options)
            .await
            .unwrap_err();
        let failure = err.into_timeout().unwrap();
        assert_eq!(failure.kind, TimeoutKind::Absolute);
        assert_eq!(failure.timeout, Duration::from_millis(200));
        assert_eq!(failure.cmd, vec!["sleep", "5"]);
        assert_eq!(failure.stdout, None);
        assert_eq!(failure.stderr, None);
    }

    #[tokio::test]
    async fn test_inactivity_timeout_keeps_partial_line() {
        let options = RunOptions::default().log_timeout(Duration::from_millis(300));
        let err = run(&sh("printf 'no newline yet'; sleep 5"), &options)
            .await
            .unwrap_err();
        let failure = err.into_timeout().unwrap();
        assert_eq!(failure.kind, TimeoutKind::Inactivity);
        assert_eq!(failure.stdout.unwrap().as_bytes(), b"no newline yet");
    }

    #[tokio::test]
    async fn test_check_rejects_nonzero_exit() {
        let options = RunOptions::default().capture_output(true).check(true);
        let err = run(&sh("echo failing; exit 2"), &options).await.unwrap_err();
        match err {
            RunError::NonZeroExit {
                returncode, stdout, ..
            } => {
                assert_eq!(returncode, 2);
                assert_eq!(stdout.unwrap().as_bytes(), b"failing\n");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_encoding_is_rejected_before_spawn() {
        let options = RunOptions::default()
            .capture_output(true)
            .encoding("utf-16", DecodeErrors::Strict);
        let err = run(&sh("echo hi"), &options).await.unwrap_err();
        assert!(matches!(err, RunError::InvalidPolicy(_)));
    }

    #[tokio::test]
    async fn test_run_argv_empty() {
        let empty: Vec<String> = Vec::new();
        let err = run_argv(empty, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_drain_grace_bounds_inherited_pipes() {
        // The background `sleep` outlives the shell and keeps stdout open.
        let script = "echo started; sleep 5 & exit 0";
        let options = RunOptions::default()
            .capture_output(true)
            .drain_grace(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = run(&sh(script), &options).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(result.returncode, 0);
        assert_eq!(result.stdout.unwrap().as_bytes(), b"started\n");
    }

    #[tokio::test]
    async fn test_timeout_survives_undecodable_tail() {
        // Killed halfway through a two-byte character.
        let options = RunOptions::default()
            .log_timeout(Duration::from_millis(300))
            .encoding("utf-8", DecodeErrors::Strict);
        let err = run(&sh("printf 'ok\\n\\303'; sleep 5"), &options)
            .await
            .unwrap_err();
        let failure = err.into_timeout().unwrap();
        assert_eq!(failure.kind, TimeoutKind::Inactivity);
        assert_eq!(failure.stdout, Some(Captured::Text("ok\n\u{FFFD}".to_string())));
    }

    #[tokio::test]
    async fn test_undecodable_tail_after_exit_is_decode_error() {
        let options = RunOptions::default()
            .capture_output(true)
            .encoding("utf-8", DecodeErrors::Strict);
        let err = run(&sh("printf 'ok\\n\\303'"), &options).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Decode {
                stream: StreamId::Stdout,
                offset: 3,
                ..
            }
        ));
    }
}
