/// Core types and errors for the jailbox sandbox
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which output stream of the child a line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Item queued by a stream monitor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamItem {
    /// One line with trailing line terminators stripped
    Line(String),
    /// The stream closed; queued exactly once per run
    EndOfStream,
}

/// Result of a blocking-with-timeout read from a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadResult {
    /// A line of output
    Line(String),
    /// The stream has closed for this run
    EndOfStream,
    /// Nothing arrived within the timeout
    Timeout,
}

impl ReadResult {
    /// Line content, if this result carries one
    pub fn line(&self) -> Option<&str> {
        match self {
            ReadResult::Line(line) => Some(line),
            _ => None,
        }
    }
}

impl From<StreamItem> for ReadResult {
    fn from(item: StreamItem) -> Self {
        match item {
            StreamItem::Line(line) => ReadResult::Line(line),
            StreamItem::EndOfStream => ReadResult::EndOfStream,
        }
    }
}

/// Signals delivered to every process inside a jail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JailSignal {
    Kill,
    Cont,
    Stop,
}

impl JailSignal {
    /// Name as understood by `kill -<NAME>`
    pub fn as_str(&self) -> &'static str {
        match self {
            JailSignal::Kill => "KILL",
            JailSignal::Cont => "CONT",
            JailSignal::Stop => "STOP",
        }
    }
}

impl fmt::Display for JailSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step of slot staging, reported when staging fails
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingStep {
    /// `helper c <id>`: hand the scratch area to the controlling identity
    TakeOwnership,
    /// Removing the previous scratch contents
    ClearScratch,
    /// Copying the working directory into the slot home
    CopyIn,
    /// `helper j <id>`: hand the scratch area to the jailed identity
    GiveOwnership,
}

impl fmt::Display for StagingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StagingStep::TakeOwnership => "take ownership",
            StagingStep::ClearScratch => "clear scratch area",
            StagingStep::CopyIn => "copy working directory",
            StagingStep::GiveOwnership => "give ownership",
        };
        f.write_str(name)
    }
}

/// Externally observable lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Constructed (slot staged if secure), no command running
    Ready,
    /// A command is running or stopped
    Running,
    /// The last command has terminated
    Dead,
    /// Results were copied back out of the slot
    Retrieved,
    /// The slot went back to the pool; the session is finished
    Released,
}

/// Errors raised by the sandbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not find an unlocked jail under {base}")]
    NoAvailableSlot { base: String },

    #[error("Jail released by different pid, name {slot}, lock_pid {lock_pid}, release_pid {release_pid}")]
    LockOwnershipViolation {
        slot: String,
        lock_pid: u32,
        release_pid: u32,
    },

    #[error("Attempt to use jail {slot} which is not locked")]
    LockNotHeld { slot: String },

    #[error("Lock for jail {slot} is corrupted: {detail}")]
    LockCorrupted { slot: String, detail: String },

    #[error("Staging jail {slot} failed at '{step}': {detail}")]
    StagingFailed {
        slot: u32,
        step: StagingStep,
        detail: String,
    },

    #[error("Retrieving results from jail {slot} failed: {detail}")]
    RetrieveFailed { slot: u32, detail: String },

    #[error("Error returned from jail {slot} sending signal {signal}: {detail}")]
    SignalDeliveryFailed {
        slot: String,
        signal: JailSignal,
        detail: String,
    },

    #[error("Failed to start {command}: {source}")]
    LaunchFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Tried to run command with one in progress")]
    AlreadyRunning,

    #[error("Tried to retrieve sandbox while still alive")]
    RetrieveWhileAlive,

    #[error("Sandbox released while still alive")]
    ReleaseWhileAlive,

    #[error("Sandbox has already been released")]
    AlreadyReleased,
}

/// Result type alias for jailbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
