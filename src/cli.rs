/// Command line driver: start a command, feed it lines, print what it says
use crate::config::SandboxConfig;
use crate::sandbox::SandboxSession;
use crate::types::ReadResult;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// How long to wait for each queued stderr line after the command is killed
const STDERR_DRAIN_WAIT: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "jailbox")]
#[command(about = "Run a command in a sandbox and talk to it line by line", long_about = None)]
pub struct Cli {
    /// Working directory to run command in (copied in secure mode)
    #[arg(short = 'd', long = "directory", default_value = ".")]
    pub working_dir: PathBuf,

    /// String to send as a line on the command's stdin
    #[arg(short = 'l', value_name = "LINE")]
    pub send_lines: Vec<String>,

    /// Time in seconds to sleep after sending a line
    #[arg(short = 's', long = "send-delay", default_value_t = 0.0)]
    pub send_delay: f64,

    /// Time in seconds to wait for another response line
    #[arg(short = 'r', long = "receive-wait", default_value_t = 600.0)]
    pub receive_wait: f64,

    /// Run in a secure jail
    #[arg(short = 'j', long = "jail", conflicts_with = "open")]
    pub jail: bool,

    /// Run without using a secure jail
    #[arg(short = 'o', long = "open")]
    pub open: bool,

    /// Command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Mode chosen on the command line, if any
    pub fn secure(&self) -> Option<bool> {
        if self.jail {
            Some(true)
        } else if self.open {
            Some(false)
        } else {
            None
        }
    }
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid {}: {}", what, value))
}

/// Run one session as described by `cli`, printing to `out`; returns the exit code
pub fn run<W: Write>(cli: &Cli, config: &SandboxConfig, out: &mut W) -> Result<i32> {
    let send_delay = seconds(cli.send_delay, "send delay")?;
    let receive_wait = seconds(cli.receive_wait, "receive wait")?;
    let secure = cli.secure().unwrap_or(config.secure_default);

    writeln!(out, "Using secure sandbox: {}", secure)?;
    writeln!(out, "Sandbox working directory: {}", cli.working_dir.display())?;

    let mut session = SandboxSession::new(&cli.working_dir, Some(secure), config)
        .context("Failed to create sandbox")?;

    let result = drive(&mut session, cli, send_delay, receive_wait, out);
    if let Err(e) = session.kill() {
        log::error!("Failed to kill sandboxed command: {}", e);
    }
    session.release().context("Failed to release sandbox")?;
    result
}

fn drive<W: Write>(
    session: &mut SandboxSession,
    cli: &Cli,
    send_delay: Duration,
    receive_wait: Duration,
    out: &mut W,
) -> Result<i32> {
    writeln!(out)?;
    let command = cli.command.join(" ");
    session
        .start(&command)
        .with_context(|| format!("Failed to start '{}'", command))?;

    for line in &cli.send_lines {
        if !session.write_line(line) {
            eprintln!("Could not send line '{}'", line);
            return Ok(1);
        }
        writeln!(out, "sent: {}", line)?;
        thread::sleep(send_delay);
    }

    while let ReadResult::Line(response) = session.read_line(receive_wait) {
        writeln!(out, "response: {}", response)?;
    }
    writeln!(out)?;
    writeln!(out, "No more responses. Terminating.")?;

    session.kill()?;
    while let ReadResult::Line(error) = session.read_error(STDERR_DRAIN_WAIT) {
        writeln!(out, "stderr: {}", error)?;
    }
    Ok(0)
}
