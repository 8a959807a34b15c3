//! Result types handed back to the caller once a run is decided.

use serde::Serialize;
use std::time::Duration;

/// Captured output of one stream: raw bytes, or decoded text in text mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Bytes(Vec<u8>),
    Text(String),
}

impl Captured {
    /// The captured bytes. For text this is the UTF-8 form of the decoded string.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Captured::Bytes(bytes) => bytes,
            Captured::Text(text) => text.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Captured::Text(text) => Some(text),
            Captured::Bytes(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A child that ran to completion (whatever its exit code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// Exit code, or `-signal` if the child was killed by a signal.
    pub returncode: i32,
    /// `None` only when capture was never active for this run.
    pub stdout: Option<Captured>,
    pub stderr: Option<Captured>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Wall-clock budget for the whole run was exhausted.
    Absolute,
    /// No new output line arrived within the inactivity window.
    Inactivity,
}

impl TimeoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::Absolute => "timeout",
            TimeoutKind::Inactivity => "log_timeout",
        }
    }
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run killed on a deadline, with whatever output was captured before the kill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutFailure {
    pub kind: TimeoutKind,
    pub cmd: Vec<String>,
    /// The configured duration of the deadline that fired.
    pub timeout: Duration,
    pub stdout: Option<Captured>,
    pub stderr: Option<Captured>,
}

impl std::fmt::Display for TimeoutFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.timeout.as_secs_f64();
        match self.kind {
            TimeoutKind::Absolute => {
                write!(f, "command {:?} timed out after {} seconds", self.cmd, secs)
            }
            TimeoutKind::Inactivity => write!(
                f,
                "command {:?} produced no output for {} seconds",
                self.cmd, secs
            ),
        }
    }
}

impl std::error::Error for TimeoutFailure {}
