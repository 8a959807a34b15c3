//! Timeout and capture settings for a single run.

use crate::decode::LineDecoder;
use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// The two independent deadlines. Absent or zero means disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    timeout: Option<Duration>,
    log_timeout: Option<Duration>,
}

impl TimeoutPolicy {
    pub fn new(timeout: Option<Duration>, log_timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.filter(|d| !d.is_zero()),
            log_timeout: log_timeout.filter(|d| !d.is_zero()),
        }
    }

    /// Build from fractional seconds, as they come from flags and config files.
    pub fn from_secs(timeout: Option<f64>, log_timeout: Option<f64>) -> Result<Self, PolicyError> {
        Ok(Self::new(
            secs_to_duration("timeout", timeout)?,
            secs_to_duration("log_timeout", log_timeout)?,
        ))
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self::new(Some(timeout), self.log_timeout)
    }

    pub fn with_log_timeout(self, log_timeout: Duration) -> Self {
        Self::new(self.timeout, Some(log_timeout))
    }

    /// Absolute wall-clock budget for the whole run.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Maximum silence between two output lines.
    pub fn log_timeout(&self) -> Option<Duration> {
        self.log_timeout
    }
}

fn secs_to_duration(name: &'static str, secs: Option<f64>) -> Result<Option<Duration>, PolicyError> {
    match secs {
        None => Ok(None),
        Some(value) => Duration::try_from_secs_f64(value)
            .map(Some)
            .map_err(|_| PolicyError::InvalidDuration { name, value }),
    }
}

/// How decode failures are handled in text mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrors {
    /// Abort the run with a decode error.
    #[default]
    Strict,
    /// Substitute U+FFFD.
    Replace,
    /// Drop malformed bytes.
    Ignore,
}

impl DecodeErrors {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeErrors::Strict => "strict",
            DecodeErrors::Replace => "replace",
            DecodeErrors::Ignore => "ignore",
        }
    }
}

impl FromStr for DecodeErrors {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(DecodeErrors::Strict),
            "replace" => Ok(DecodeErrors::Replace),
            "ignore" => Ok(DecodeErrors::Ignore),
            _ => Err(PolicyError::UnknownErrorPolicy(s.to_string())),
        }
    }
}

/// What happens to the child's stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureMode {
    /// Capture output even when only the absolute timeout applies.
    pub capture_output: bool,
    /// Decode captured lines to text.
    pub text: bool,
    /// WHATWG encoding label; UTF-8 when unset.
    pub encoding: Option<String>,
    pub errors: DecodeErrors,
}

impl CaptureMode {
    pub fn captured() -> Self {
        Self {
            capture_output: true,
            ..Self::default()
        }
    }

    pub fn text(mut self) -> Self {
        self.text = true;
        self
    }

    pub fn encoding(mut self, label: impl Into<String>, errors: DecodeErrors) -> Self {
        self.text = true;
        self.encoding = Some(label.into());
        self.errors = errors;
        self
    }

    /// Capture is forced whenever an inactivity timeout is configured,
    /// since line boundaries are what reset it.
    pub fn is_active(&self, policy: &TimeoutPolicy) -> bool {
        self.capture_output || policy.log_timeout().is_some()
    }

    /// The decoder for text mode, or `None` when lines stay raw bytes.
    pub fn decoder(&self) -> Result<Option<LineDecoder>, PolicyError> {
        if !self.text {
            return Ok(None);
        }
        let label = self.encoding.as_deref().unwrap_or("utf-8");
        LineDecoder::for_label(label, self.errors).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_disables_timeout() {
        let policy = TimeoutPolicy::new(Some(Duration::ZERO), Some(Duration::from_secs(2)));
        assert_eq!(policy.timeout(), None);
        assert_eq!(policy.log_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_from_secs_keeps_subsecond_precision() {
        let policy = TimeoutPolicy::from_secs(Some(1.1), Some(0.9)).unwrap();
        assert_eq!(policy.timeout(), Some(Duration::from_millis(1100)));
        assert_eq!(policy.log_timeout(), Some(Duration::from_millis(900)));
    }

    #[test]
    fn test_from_secs_rejects_negative_and_nan() {
        assert!(matches!(
            TimeoutPolicy::from_secs(Some(-1.0), None),
            Err(PolicyError::InvalidDuration { name: "timeout", .. })
        ));
        assert!(matches!(
            TimeoutPolicy::from_secs(None, Some(f64::NAN)),
            Err(PolicyError::InvalidDuration { name: "log_timeout", .. })
        ));
        assert!(TimeoutPolicy::from_secs(Some(f64::INFINITY), None).is_err());
    }

    #[test]
    fn test_from_secs_zero_is_disabled() {
        let policy = TimeoutPolicy::from_secs(Some(0.0), Some(0.0)).unwrap();
        assert_eq!(policy, TimeoutPolicy::default());
    }

    #[test]
    fn test_log_timeout_forces_capture() {
        let capture = CaptureMode::default();
        assert!(!capture.is_active(&TimeoutPolicy::default()));
        assert!(!capture.is_active(&TimeoutPolicy::default().with_timeout(Duration::from_secs(1))));
        assert!(capture.is_active(&TimeoutPolicy::default().with_log_timeout(Duration::from_secs(1))));
        assert!(CaptureMode::captured().is_active(&TimeoutPolicy::default()));
    }

    #[test]
    fn test_decode_errors_parse() {
        assert_eq!("strict".parse::<DecodeErrors>().unwrap(), DecodeErrors::Strict);
        assert_eq!("Replace".parse::<DecodeErrors>().unwrap(), DecodeErrors::Replace);
        assert_eq!(" ignore ".parse::<DecodeErrors>().unwrap(), DecodeErrors::Ignore);
        assert!(matches!(
            "surrogateescape".parse::<DecodeErrors>(),
            Err(PolicyError::UnknownErrorPolicy(_))
        ));
    }

    #[test]
    fn test_decoder_only_in_text_mode() {
        assert!(CaptureMode::captured().decoder().unwrap().is_none());
        let decoder = CaptureMode::captured().text().decoder().unwrap().unwrap();
        assert_eq!(decoder.encoding_name(), "UTF-8");
    }

    #[test]
    fn test_decoder_rejects_unknown_label() {
        let capture = CaptureMode::captured().encoding("klingon", DecodeErrors::Strict);
        assert!(matches!(capture.decoder(), Err(PolicyError::UnknownEncoding(_))));
    }
}
