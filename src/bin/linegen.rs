//! Deterministic output generator for exercising runwatch timeouts.
//!
//! Prints `"{i} line"` `count` times, flushing and sleeping after each one.
//! With `--with-stderr`, odd lines go to stderr. A non-zero `--last-sleep`
//! prints `"last line"` to stdout and then sleeps once more before exiting.
use clap::Parser;
use std::io::Write;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "linegen", about)]
struct Args {
    /// Number of lines to print
    #[arg(short, long, default_value_t = 1)]
    count: u32,

    /// Seconds to sleep after each line
    #[arg(short, long, default_value_t = 1.0)]
    sleep: f64,

    /// Seconds to sleep after printing "last line"
    #[arg(short, long, default_value_t = 0.0)]
    last_sleep: f64,

    /// Send odd-numbered lines to stderr
    #[arg(short = 'e', long)]
    with_stderr: bool,
}

fn pause(secs: f64) {
    if secs > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(secs));
    }
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    for i in 0..args.count {
        if args.with_stderr && i % 2 == 1 {
            writeln!(stderr, "{i} line")?;
        } else {
            writeln!(stdout, "{i} line")?;
        }
        stdout.flush()?;
        stderr.flush()?;
        pause(args.sleep);
    }

    if args.last_sleep > 0.0 {
        writeln!(stdout, "last line")?;
        stdout.flush()?;
        pause(args.last_sleep);
    }
    Ok(())
}
