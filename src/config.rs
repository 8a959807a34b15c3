use crate::error::PolicyError;
use crate::policy::{CaptureMode, DecodeErrors, TimeoutPolicy};
use crate::runner::RunOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from runwatch.toml.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct RunwatchConfig {
    pub timeouts: TimeoutsConfig,
    pub capture: CaptureConfig,
    pub process: ProcessConfig,
}

/// Deadlines in fractional seconds. 0 disables a deadline.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct TimeoutsConfig {
    pub absolute_secs: f64,
    pub inactivity_secs: f64,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub output: bool,
    pub text: bool,
    pub encoding: String,
    pub errors: DecodeErrors,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessConfig {
    pub drain_grace_ms: u64,
    pub check: bool,
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl RunwatchConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Resolve into options for [`crate::run`], validating durations and encoding.
    pub fn run_options(&self) -> Result<RunOptions, PolicyError> {
        let policy = TimeoutPolicy::from_secs(
            Some(self.timeouts.absolute_secs),
            Some(self.timeouts.inactivity_secs),
        )?;
        let capture = CaptureMode {
            capture_output: self.capture.output,
            text: self.capture.text,
            encoding: Some(self.capture.encoding.clone()),
            errors: self.capture.errors,
        };
        // Surface a bad encoding now rather than at run time.
        capture.decoder()?;
        Ok(RunOptions {
            policy,
            capture,
            check: self.process.check,
            drain_grace: Duration::from_millis(self.process.drain_grace_ms),
        })
    }
}

// --- Default implementations ---

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output: false,
            text: false,
            encoding: "utf-8".to_string(),
            errors: DecodeErrors::Strict,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            drain_grace_ms: 2000,
            check: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_everything() {
        let config = RunwatchConfig::default();
        let options = config.run_options().unwrap();
        assert_eq!(options.policy, TimeoutPolicy::default());
        assert!(!options.capture.capture_output);
        assert!(!options.capture.text);
        assert!(!options.check);
        assert_eq!(options.drain_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[timeouts]
absolute_secs = 10
inactivity_secs = 2.5

[capture]
output = true
text = true
encoding = "latin1"
errors = "replace"

[process]
drain_grace_ms = 500
check = true
"#;
        let config: RunwatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.timeouts.absolute_secs, 10.0);
        assert_eq!(config.capture.errors, DecodeErrors::Replace);

        let options = config.run_options().unwrap();
        assert_eq!(options.policy.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(options.policy.log_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(options.capture.encoding.as_deref(), Some("latin1"));
        assert!(options.check);
        assert_eq!(options.drain_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_config_keeps_section_defaults() {
        let config: RunwatchConfig = toml::from_str("[timeouts]\ninactivity_secs = 3\n").unwrap();
        assert_eq!(config.timeouts.absolute_secs, 0.0);
        assert_eq!(config.capture, CaptureConfig::default());
        assert_eq!(config.process, ProcessConfig::default());
    }

    #[test]
    fn test_negative_timeout_is_invalid() {
        let config: RunwatchConfig = toml::from_str("[timeouts]\nabsolute_secs = -1\n").unwrap();
        assert!(matches!(
            config.run_options(),
            Err(PolicyError::InvalidDuration { name: "timeout", .. })
        ));
    }

    #[test]
    fn test_unknown_error_policy_fails_to_parse() {
        let result: Result<RunwatchConfig, _> = toml::from_str("[capture]\nerrors = \"loud\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunwatchConfig::load(&dir.path().join("runwatch.toml")).unwrap();
        assert_eq!(config, RunwatchConfig::default());
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runwatch.toml");
        std::fs::write(&path, "[timeouts\nabsolute_secs = ").unwrap();
        let err = RunwatchConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("runwatch.toml"));
    }
}
