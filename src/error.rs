use crate::outcome::{Captured, TimeoutFailure};
use crate::reader::StreamId;

/// Errors that can end a run without a `RunResult`.
#[derive(Debug)]
pub enum RunError {
    /// The child could not be started. Fatal; no partial output exists.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// One of the two deadlines elapsed and the child was killed.
    Timeout(TimeoutFailure),
    /// Strict text decoding hit malformed input.
    Decode {
        stream: StreamId,
        /// Byte offset of the first malformed byte within the stream.
        offset: u64,
        encoding: &'static str,
    },
    /// The child exited non-zero and the run was configured with `check`.
    NonZeroExit {
        cmd: Vec<String>,
        returncode: i32,
        stdout: Option<Captured>,
        stderr: Option<Captured>,
    },
    /// Rejected timeout or capture settings; nothing was spawned.
    InvalidPolicy(PolicyError),
    /// Waiting on the child or joining a reader failed.
    Io { source: std::io::Error },
}

impl RunError {
    pub fn as_timeout(&self) -> Option<&TimeoutFailure> {
        match self {
            RunError::Timeout(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn into_timeout(self) -> Option<TimeoutFailure> {
        match self {
            RunError::Timeout(failure) => Some(failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            RunError::Timeout(failure) => failure.fmt(f),
            RunError::Decode {
                stream,
                offset,
                encoding,
            } => write!(
                f,
                "cannot decode {} as {}: malformed byte at offset {}",
                stream, encoding, offset
            ),
            RunError::NonZeroExit {
                cmd, returncode, ..
            } => write!(
                f,
                "command {:?} returned non-zero exit status {}",
                cmd, returncode
            ),
            RunError::InvalidPolicy(e) => write!(f, "invalid run settings: {}", e),
            RunError::Io { source } => write!(f, "I/O error during run: {}", source),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Spawn { source, .. } => Some(source),
            RunError::Io { source } => Some(source),
            RunError::Timeout(failure) => Some(failure),
            RunError::InvalidPolicy(e) => Some(e),
            RunError::Decode { .. } | RunError::NonZeroExit { .. } => None,
        }
    }
}

impl From<PolicyError> for RunError {
    fn from(e: PolicyError) -> Self {
        RunError::InvalidPolicy(e)
    }
}

impl From<TimeoutFailure> for RunError {
    fn from(failure: TimeoutFailure) -> Self {
        RunError::Timeout(failure)
    }
}

/// Rejected timeout or capture settings.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// A duration was negative, NaN or infinite.
    InvalidDuration { name: &'static str, value: f64 },
    UnknownEncoding(String),
    /// Lines are split on byte `\n`, which only works for ASCII-compatible encodings.
    UnsupportedEncoding(String),
    UnknownErrorPolicy(String),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::InvalidDuration { name, value } => {
                write!(f, "{name} must be a finite, non-negative number of seconds (got {value})")
            }
            PolicyError::UnknownEncoding(label) => write!(f, "unknown encoding: {label}"),
            PolicyError::UnsupportedEncoding(label) => {
                write!(f, "encoding {label} is not ASCII-compatible")
            }
            PolicyError::UnknownErrorPolicy(name) => {
                write!(f, "unknown decode error policy: {name} (expected strict, replace or ignore)")
            }
        }
    }
}

impl std::error::Error for PolicyError {}
