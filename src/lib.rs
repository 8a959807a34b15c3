//! Run a child process under two independent deadlines: an absolute
//! wall-clock timeout and an inactivity timeout that resets whenever the
//! child writes a new line to stdout or stderr.
//!
//! ```no_run
//! use runwatch::{run, Command, RunOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), runwatch::RunError> {
//! let options = RunOptions::default()
//!     .timeout(Duration::from_secs(60))
//!     .log_timeout(Duration::from_secs(5));
//! let result = run(&Command::new("make").arg("test"), &options).await?;
//! println!("exit {}", result.returncode);
//! # Ok(())
//! # }
//! ```

pub mod arbiter;
pub mod command;
pub mod config;
pub mod decode;
pub mod error;
pub mod outcome;
pub mod policy;
pub mod process;
pub mod reader;
pub mod report;
pub mod runner;

pub use command::Command;
pub use error::{PolicyError, RunError};
pub use outcome::{Captured, RunResult, TimeoutFailure, TimeoutKind};
pub use policy::{CaptureMode, DecodeErrors, TimeoutPolicy};
pub use reader::StreamId;
pub use runner::{run, run_argv, RunOptions};
