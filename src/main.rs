use clap::Parser;
use runwatch::config::RunwatchConfig;
use runwatch::report::RunReport;
use runwatch::{Captured, Command, DecodeErrors, RunError, RunOptions, RunResult, TimeoutKind};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const EXIT_TIMEOUT: u8 = 124;
const EXIT_LOG_TIMEOUT: u8 = 125;
const EXIT_CANNOT_EXECUTE: u8 = 126;
const EXIT_NOT_FOUND: u8 = 127;

/// Run a command with an absolute timeout and an output-inactivity timeout.
#[derive(Parser, Debug)]
#[command(name = "runwatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "runwatch.toml")]
    config: PathBuf,

    /// Absolute timeout in seconds (overrides config; 0 disables)
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Inactivity timeout in seconds: kill the command if it prints no new line for this long
    #[arg(short, long, value_name = "SECS")]
    log_timeout: Option<f64>,

    /// Capture output even when only the absolute timeout applies
    #[arg(long)]
    capture: bool,

    /// Decode captured output as text
    #[arg(long)]
    text: bool,

    /// Text encoding label (implies --text)
    #[arg(long)]
    encoding: Option<String>,

    /// Decode error policy: strict, replace or ignore
    #[arg(long)]
    errors: Option<DecodeErrors>,

    /// Fail when the command exits non-zero
    #[arg(long)]
    check: bool,

    /// Write a JSON run report to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (line events, reader lifecycle)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Command to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    /// Fold command-line overrides into the loaded config.
    fn apply_overrides(&self, config: &mut RunwatchConfig) {
        if let Some(timeout) = self.timeout {
            config.timeouts.absolute_secs = timeout;
        }
        if let Some(log_timeout) = self.log_timeout {
            config.timeouts.inactivity_secs = log_timeout;
        }
        if self.capture {
            config.capture.output = true;
        }
        if self.text {
            config.capture.text = true;
        }
        if let Some(ref encoding) = self.encoding {
            config.capture.text = true;
            config.capture.encoding = encoding.clone();
        }
        if let Some(errors) = self.errors {
            config.capture.errors = errors;
        }
        if self.check {
            config.process.check = true;
        }
    }

    fn log_filter(&self) -> EnvFilter {
        let default = if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match RunwatchConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    let options = match config.run_options() {
        Ok(o) => o,
        Err(e) => {
            tracing::error!("invalid settings: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(command) = Command::from_argv(cli.command.iter().cloned()) else {
        tracing::error!("no command given");
        return ExitCode::FAILURE;
    };

    if cli.dry_run {
        print_settings(&command, &options);
        return ExitCode::SUCCESS;
    }

    let started_at = chrono::Utc::now();
    let clock = std::time::Instant::now();
    let result = runwatch::run(&command, &options).await;

    if let Some(ref path) = cli.report {
        let report = RunReport::new(command.argv(), started_at, clock.elapsed(), &result);
        if let Err(e) = report.write(path) {
            tracing::warn!("{e}");
        }
    }

    finish(result)
}

fn print_settings(command: &Command, options: &RunOptions) {
    let secs = |d: Option<std::time::Duration>| {
        d.map(|d| format!("{}s", d.as_secs_f64()))
            .unwrap_or_else(|| "disabled".to_string())
    };
    println!("command:      {command}");
    println!("timeout:      {}", secs(options.policy.timeout()));
    println!("log timeout:  {}", secs(options.policy.log_timeout()));
    println!("capture:      {}", options.capture.is_active(&options.policy));
    println!(
        "text:         {} ({}, errors={})",
        options.capture.text,
        options.capture.encoding.as_deref().unwrap_or("utf-8"),
        options.capture.errors.as_str()
    );
    println!("check:        {}", options.check);
    println!("drain grace:  {}ms", options.drain_grace.as_millis());
}

/// Re-emit captured output and map the outcome to an exit code.
fn finish(result: Result<RunResult, RunError>) -> ExitCode {
    match result {
        Ok(run) => {
            emit(run.stdout.as_ref(), run.stderr.as_ref());
            ExitCode::from(exit_status_byte(run.returncode))
        }
        Err(RunError::Timeout(failure)) => {
            emit(failure.stdout.as_ref(), failure.stderr.as_ref());
            tracing::error!("{failure}");
            match failure.kind {
                TimeoutKind::Absolute => ExitCode::from(EXIT_TIMEOUT),
                TimeoutKind::Inactivity => ExitCode::from(EXIT_LOG_TIMEOUT),
            }
        }
        Err(RunError::NonZeroExit {
            returncode,
            stdout,
            stderr,
            ..
        }) => {
            emit(stdout.as_ref(), stderr.as_ref());
            tracing::error!("command exited with status {returncode}");
            ExitCode::from(exit_status_byte(returncode))
        }
        Err(RunError::Spawn { program, source }) => {
            tracing::error!("failed to spawn {program}: {source}");
            match source.kind() {
                std::io::ErrorKind::NotFound => ExitCode::from(EXIT_NOT_FOUND),
                _ => ExitCode::from(EXIT_CANNOT_EXECUTE),
            }
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn emit(stdout: Option<&Captured>, stderr: Option<&Captured>) {
    if let Some(out) = stdout {
        let mut handle = std::io::stdout().lock();
        let _ = handle.write_all(out.as_bytes()).and_then(|_| handle.flush());
    }
    if let Some(err) = stderr {
        let _ = std::io::stderr().write_all(err.as_bytes());
    }
}

/// Exit status byte for a child return code; signals map to 128 + signal.
fn exit_status_byte(returncode: i32) -> u8 {
    if returncode < 0 {
        128u8.wrapping_add(returncode.unsigned_abs() as u8)
    } else {
        (returncode & 0xff) as u8
    }
}
