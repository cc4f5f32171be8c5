/// jailbox: run a command in a sandbox and talk to it line by line
///
/// # Usage
/// ```bash
/// jailbox -o -l "hello" -r 2 cat
/// jailbox -j -d ./bot -l "turn 1" -s 0.1 python3 MyBot.py
/// ```
use anyhow::{Context, Result};
use clap::Parser;
use jailbox::cli::{self, Cli};
use jailbox::config::SandboxConfig;

fn main() -> Result<()> {
    env_logger::init();

    // Signals, pipes and the jail protocol are Unix-only
    if !cfg!(unix) {
        eprintln!("Error: jailbox requires a Unix-like system");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let config = SandboxConfig::discover().context("Failed to load server info")?;

    let code = cli::run(&cli, &config, &mut std::io::stdout().lock())?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
