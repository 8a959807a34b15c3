//! Run report: a JSON summary of one run, written atomically.

use crate::error::RunError;
use crate::outcome::{Captured, RunResult, TimeoutKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Exited,
    Timeout,
    LogTimeout,
    NonZeroExit,
    SpawnFailed,
    DecodeFailed,
    Error,
}

/// The JSON payload written by `--report`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub command: Vec<String>,
    pub outcome: ReportOutcome,
    pub returncode: Option<i32>,
    /// Configured duration of the deadline that fired.
    pub timeout_secs: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub stdout_bytes: Option<usize>,
    pub stderr_bytes: Option<usize>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(
        command: Vec<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        result: &Result<RunResult, RunError>,
    ) -> Self {
        let mut report = Self {
            command,
            outcome: ReportOutcome::Exited,
            returncode: None,
            timeout_secs: None,
            started_at,
            duration_secs: duration.as_secs_f64(),
            stdout_bytes: None,
            stderr_bytes: None,
            error: None,
        };
        match result {
            Ok(run) => {
                report.returncode = Some(run.returncode);
                report.stdout_bytes = run.stdout.as_ref().map(Captured::len);
                report.stderr_bytes = run.stderr.as_ref().map(Captured::len);
            }
            Err(e) => {
                report.error = Some(e.to_string());
                match e {
                    RunError::Timeout(failure) => {
                        report.outcome = match failure.kind {
                            TimeoutKind::Absolute => ReportOutcome::Timeout,
                            TimeoutKind::Inactivity => ReportOutcome::LogTimeout,
                        };
                        report.timeout_secs = Some(failure.timeout.as_secs_f64());
                        report.stdout_bytes = failure.stdout.as_ref().map(Captured::len);
                        report.stderr_bytes = failure.stderr.as_ref().map(Captured::len);
                    }
                    RunError::NonZeroExit {
                        returncode,
                        stdout,
                        stderr,
                        ..
                    } => {
                        report.outcome = ReportOutcome::NonZeroExit;
                        report.returncode = Some(*returncode);
                        report.stdout_bytes = stdout.as_ref().map(Captured::len);
                        report.stderr_bytes = stderr.as_ref().map(Captured::len);
                    }
                    RunError::Spawn { .. } => report.outcome = ReportOutcome::SpawnFailed,
                    RunError::Decode { .. } => report.outcome = ReportOutcome::DecodeFailed,
                    RunError::InvalidPolicy(_) | RunError::Io { .. } => {
                        report.outcome = ReportOutcome::Error
                    }
                }
            }
        }
        report
    }

    /// Atomically write the report to `path`.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ReportError::Serialize { source: e })?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ReportError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| ReportError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;
        tmp.persist(path).map_err(|e| ReportError::Write {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }
}

/// Errors from writing the report file.
#[derive(Debug)]
pub enum ReportError {
    Serialize { source: serde_json::Error },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => {
                write!(f, "failed to serialize run report: {}", source)
            }
            ReportError::Write { path, source } => {
                write!(f, "failed to write run report {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
        }
    }
}
