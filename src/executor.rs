/// Invocation of external helpers and command-line tokenization
///
/// Each external call yields an `ExternalOutcome` so callers keep the
/// difference between failures they tolerate and failures that abort.
use crate::types::{Result, SandboxError};
use std::process::{Command, Stdio};

/// How a failure of one invocation is treated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Failure aborts the current operation
    Fatal,
    /// Failure is logged and the operation continues
    BestEffort,
}

/// Typed result of one external step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalOutcome {
    Success,
    /// Failed, but the caller can carry on (stale data at worst)
    Recoverable(String),
    /// Failed and the caller must stop
    Fatal(String),
}

impl ExternalOutcome {
    /// Classify a raw pass/fail under a policy
    pub fn classify(result: std::result::Result<(), String>, policy: FailurePolicy) -> Self {
        match (result, policy) {
            (Ok(()), _) => ExternalOutcome::Success,
            (Err(detail), FailurePolicy::BestEffort) => ExternalOutcome::Recoverable(detail),
            (Err(detail), FailurePolicy::Fatal) => ExternalOutcome::Fatal(detail),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExternalOutcome::Success)
    }

    /// Collapse into a `Result`, logging recoverable failures under `what`
    pub fn into_result<F>(self, what: &str, fatal: F) -> Result<()>
    where
        F: FnOnce(String) -> SandboxError,
    {
        match self {
            ExternalOutcome::Success => Ok(()),
            ExternalOutcome::Recoverable(detail) => {
                log::warn!("{} failed, continuing: {}", what, detail);
                Ok(())
            }
            ExternalOutcome::Fatal(detail) => Err(fatal(detail)),
        }
    }
}

/// An external program whose exit status is its only contract
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
}

impl ExternalCommand {
    pub fn new<S: Into<String>>(program: S, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a shell-style command line
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut words = split_command(command_line)?;
        let program = words.remove(0);
        Ok(Self::new(program, words))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Run to completion; `Err` carries a description of the failure
    pub fn status(&self) -> std::result::Result<(), String> {
        log::debug!("Running external command: {}", self);

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| format!("could not run '{}': {}", self, e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            Err(format!("'{}' exited with {}", self, output.status))
        } else {
            Err(format!("'{}' exited with {}: {}", self, output.status, stderr))
        }
    }

    /// Run and classify under `policy`
    pub fn run(&self, policy: FailurePolicy) -> ExternalOutcome {
        ExternalOutcome::classify(self.status(), policy)
    }
}

impl std::fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Tokenize a command line with shell-word rules after normalizing path separators
pub fn split_command(command_line: &str) -> Result<Vec<String>> {
    let normalized = command_line.replace('\\', "/");
    let words = shlex::split(&normalized).ok_or_else(|| {
        SandboxError::InvalidCommand(format!("unbalanced quoting in '{}'", command_line))
    })?;
    if words.is_empty() {
        return Err(SandboxError::InvalidCommand("empty command".to_string()));
    }
    Ok(words)
}
