//! Interactive sandbox session
//!
//! A [`SandboxSession`] runs one shell command at a time, either directly in
//! the caller's working directory or inside a locked jail slot, and exposes
//! the child's stdio as lines:
//!
//! ```no_run
//! use jailbox::config::SandboxConfig;
//! use jailbox::sandbox::SandboxSession;
//! use std::time::Duration;
//!
//! # fn main() -> jailbox::types::Result<()> {
//! let config = SandboxConfig::discover()?;
//! let mut session = SandboxSession::new(".", Some(false), &config)?;
//! session.start("cat")?;
//! session.write_line("hello");
//! println!("{:?}", session.read_line(Duration::from_secs(5)));
//! session.kill()?;
//! session.retrieve()?;
//! session.release()?;
//! # Ok(())
//! # }
//! ```
//!
//! Lifecycle: `start` → (`write`/`read_line`/`pause`/`resume`)* → `kill` →
//! `retrieve` → `release`. `release` must be called exactly once for a
//! secure session or its slot stays locked.
use crate::config::SandboxConfig;
use crate::executor::split_command;
use crate::io_handler::{OutputQueue, StreamMonitor};
use crate::isolate::IsolatedSlot;
use crate::types::{ReadResult, Result, SandboxError, SessionState, StreamKind};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::time::Duration;

/// Longest wait for output from a command that has already exited
pub const TAIL_GRACE: Duration = Duration::from_millis(100);

/// A command runner bound to one working directory and security mode
pub struct SandboxSession {
    session_id: String,
    working_directory: PathBuf,
    slot: Option<IsolatedSlot>,
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    alive: bool,
    stdout_queue: OutputQueue,
    stderr_queue: OutputQueue,
    stdout_monitor: Option<StreamMonitor>,
    stderr_monitor: Option<StreamMonitor>,
    retrieved: bool,
    released: bool,
}

impl SandboxSession {
    /// Create a session; `secure: None` uses the configured default
    ///
    /// In secure mode a slot is locked and `working_directory` is staged
    /// into it before this returns.
    pub fn new<P: Into<PathBuf>>(
        working_directory: P,
        secure: Option<bool>,
        config: &SandboxConfig,
    ) -> Result<Self> {
        let working_directory = working_directory.into();
        if secure.unwrap_or(config.secure_default) {
            let slot = IsolatedSlot::acquire(config)?;
            Self::with_slot(working_directory, slot)
        } else {
            Ok(Self::build(working_directory, None))
        }
    }

    /// Create a secure session around an already locked slot
    ///
    /// If staging fails the slot is abandoned (left locked) rather than
    /// handed back to the pool in an unknown state.
    pub fn with_slot<P: Into<PathBuf>>(working_directory: P, mut slot: IsolatedSlot) -> Result<Self> {
        let working_directory: PathBuf = working_directory.into();
        if let Err(e) = slot.stage(&working_directory) {
            slot.abandon();
            return Err(e);
        }
        let home_dir = slot
            .home_dir()
            .map(Path::to_path_buf)
            .ok_or_else(|| SandboxError::Config("staged slot has no home directory".to_string()))?;
        Ok(Self::build(home_dir, Some(slot)))
    }

    fn build(working_directory: PathBuf, slot: Option<IsolatedSlot>) -> Self {
        let session = Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            working_directory,
            slot,
            process: None,
            stdin: None,
            alive: false,
            stdout_queue: OutputQueue::new(),
            stderr_queue: OutputQueue::new(),
            stdout_monitor: None,
            stderr_monitor: None,
            retrieved: false,
            released: false,
        };
        log::debug!(
            "Session {} ready in {} (secure={})",
            session.session_id,
            session.working_directory.display(),
            session.is_secure()
        );
        session
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Directory the command sees as its working directory
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn is_secure(&self) -> bool {
        self.slot.is_some()
    }

    pub fn slot(&self) -> Option<&IsolatedSlot> {
        self.slot.as_ref()
    }

    /// Pid of the direct child of the latest run
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(Child::id)
    }

    /// Whether a command is running; termination is cached once seen
    pub fn is_alive(&mut self) -> bool {
        if self.alive {
            if let Some(child) = self.process.as_mut() {
                match child.try_wait() {
                    Ok(None) => return true,
                    Ok(Some(status)) => {
                        log::debug!("Session {} command exited: {}", self.session_id, status)
                    }
                    Err(e) => log::warn!("Session {} could not poll child: {}", self.session_id, e),
                }
            }
            self.alive = false;
        }
        false
    }

    /// Exit status of the latest run, once it has terminated
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.process.as_mut()?.try_wait().ok().flatten()
    }

    pub fn state(&mut self) -> SessionState {
        if self.released {
            SessionState::Released
        } else if self.retrieved {
            SessionState::Retrieved
        } else if self.is_alive() {
            SessionState::Running
        } else if self.process.is_some() {
            SessionState::Dead
        } else {
            SessionState::Ready
        }
    }

    /// Monitor threads of the latest run still draining their stream
    pub fn active_monitors(&self) -> usize {
        [&self.stdout_monitor, &self.stderr_monitor]
            .into_iter()
            .flatten()
            .filter(|monitor| !monitor.is_finished())
            .count()
    }

    /// Launch `command` with piped stdio
    pub fn start(&mut self, command: &str) -> Result<()> {
        if self.released {
            return Err(SandboxError::AlreadyReleased);
        }
        if self.is_alive() {
            return Err(SandboxError::AlreadyRunning);
        }

        let (command_line, cwd) = match self.slot {
            Some(ref slot) => (format!("{}{}", slot.invocation_prefix(), command), None),
            None => (command.to_string(), Some(self.working_directory.clone())),
        };
        let words = split_command(&command_line)?;

        let mut cmd = Command::new(&words[0]);
        cmd.args(&words[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SandboxError::LaunchFailed {
            command: command_line.clone(),
            source,
        })?;
        log::info!(
            "Session {} started '{}' (pid {})",
            self.session_id,
            command_line,
            child.id()
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.stdin = child.stdin.take();
        self.process = Some(child);
        self.alive = true;
        self.retrieved = false;

        if let Err(e) = self.spawn_monitors(stdout, stderr) {
            if let Err(kill_err) = self.kill() {
                log::error!("Session {} cleanup after failed start: {}", self.session_id, kill_err);
            }
            return Err(e);
        }
        Ok(())
    }

    fn spawn_monitors<O, E>(&mut self, stdout: Option<O>, stderr: Option<E>) -> Result<()>
    where
        O: std::io::Read + Send + 'static,
        E: std::io::Read + Send + 'static,
    {
        // Fresh queues per run; monitors of an earlier run lose their receiver
        self.stdout_queue = OutputQueue::new();
        self.stderr_queue = OutputQueue::new();
        self.stdout_monitor = match stdout {
            Some(pipe) => Some(StreamMonitor::spawn(
                StreamKind::Stdout,
                pipe,
                self.stdout_queue.sender(),
            )?),
            None => None,
        };
        self.stderr_monitor = match stderr {
            Some(pipe) => Some(StreamMonitor::spawn(
                StreamKind::Stderr,
                pipe,
                self.stderr_queue.sender(),
            )?),
            None => None,
        };
        Ok(())
    }

    /// Write raw bytes to the command's stdin
    ///
    /// Returns false when nothing is running or the pipe broke; a broken
    /// pipe also kills the command.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.is_alive() {
            return false;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };

        if let Err(e) = stdin.write_all(data).and_then(|_| stdin.flush()) {
            log::warn!("Session {} write failed: {}", self.session_id, e);
            if let Err(kill_err) = self.kill() {
                log::error!("Session {} kill after write failure: {}", self.session_id, kill_err);
            }
            return false;
        }
        true
    }

    /// Write `line` plus one newline to the command's stdin
    pub fn write_line(&mut self, line: &str) -> bool {
        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        data.push('\n');
        self.write(data.as_bytes())
    }

    /// Next stdout line, waiting up to `timeout`
    pub fn read_line(&mut self, timeout: Duration) -> ReadResult {
        self.read_from(StreamKind::Stdout, timeout)
    }

    /// Next stderr line, waiting up to `timeout`
    pub fn read_error(&mut self, timeout: Duration) -> ReadResult {
        self.read_from(StreamKind::Stderr, timeout)
    }

    fn read_from(&mut self, kind: StreamKind, timeout: Duration) -> ReadResult {
        let monitor = match kind {
            StreamKind::Stdout => &self.stdout_monitor,
            StreamKind::Stderr => &self.stderr_monitor,
        };
        let draining = monitor.as_ref().map_or(false, |m| !m.is_finished());
        // Dead command: only a short grace for output still in flight, since
        // a lingering grandchild may hold the pipe open indefinitely
        let timeout = if self.is_alive() {
            timeout
        } else if draining {
            timeout.min(TAIL_GRACE)
        } else {
            Duration::ZERO
        };

        match kind {
            StreamKind::Stdout => self.stdout_queue.pop(timeout),
            StreamKind::Stderr => self.stderr_queue.pop(timeout),
        }
    }

    /// Stop the command and reap it; a no-op when nothing is running
    pub fn kill(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        if let Some(ref slot) = self.slot {
            slot.kill()?;
        } else if let Some(child) = self.process.as_mut() {
            if let Err(e) = child.kill() {
                log::debug!("Session {} child already gone: {}", self.session_id, e);
            }
        }

        self.stdin = None;
        if let Some(child) = self.process.as_mut() {
            let status = child.wait()?;
            log::info!("Session {} command reaped: {}", self.session_id, status);
        }
        self.alive = false;
        Ok(())
    }

    /// Stop the command without killing it
    pub fn pause(&mut self) -> Result<()> {
        match self.slot {
            Some(ref slot) => slot.pause(),
            None => {
                self.signal_child(Signal::SIGSTOP);
                Ok(())
            }
        }
    }

    /// Continue a paused command
    pub fn resume(&mut self) -> Result<()> {
        match self.slot {
            Some(ref slot) => slot.resume(),
            None => {
                self.signal_child(Signal::SIGCONT);
                Ok(())
            }
        }
    }

    fn signal_child(&mut self, sig: Signal) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.pid() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
                log::debug!("Session {} could not send {}: {}", self.session_id, sig, e);
            }
        }
    }

    /// Copy the jail's working directory back to where it came from
    pub fn retrieve(&mut self) -> Result<()> {
        if self.released {
            return Err(SandboxError::AlreadyReleased);
        }
        if self.is_alive() {
            return Err(SandboxError::RetrieveWhileAlive);
        }
        if let Some(ref mut slot) = self.slot {
            slot.retrieve()?;
        }
        self.retrieved = true;
        Ok(())
    }

    /// Return the slot to the pool; the last call on a session
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(SandboxError::AlreadyReleased);
        }
        if self.is_alive() {
            return Err(SandboxError::ReleaseWhileAlive);
        }
        if let Some(ref mut slot) = self.slot {
            slot.release()?;
        }
        self.released = true;
        log::debug!("Session {} released", self.session_id);
        Ok(())
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if self.is_alive() {
            log::warn!("Session {} dropped with a running command, killing it", self.session_id);
            if let Err(e) = self.kill() {
                log::error!("Session {} kill on drop failed: {}", self.session_id, e);
            }
        }
    }
}
