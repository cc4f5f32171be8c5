/// One locked jail: staging, signal fan-out and result retrieval
use crate::config::{JailConfig, SandboxConfig};
use crate::executor::{ExternalCommand, ExternalOutcome, FailurePolicy};
use crate::filesystem::{copy_tree, remove_tree, tree_listing};
use crate::lock_manager::{DirLockBackend, SlotLock};
use crate::types::{JailSignal, Result, SandboxError, StagingStep};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Scratch area inside a slot, replaced on every staging
const SCRATCH_DIR_NAME: &str = "scratch";

/// Direction of an ownership transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ownership {
    /// To the controlling (host) identity
    Control,
    /// To the jailed identity
    Jailed,
}

impl Ownership {
    fn flag(self) -> &'static str {
        match self {
            Ownership::Control => "c",
            Ownership::Jailed => "j",
        }
    }
}

/// A held slot together with the working directory staged into it
pub struct IsolatedSlot {
    lock: SlotLock,
    jail: JailConfig,
    helper: PathBuf,
    slot_dir: PathBuf,
    home_dir: Option<PathBuf>,
    source_dir: Option<PathBuf>,
}

impl IsolatedSlot {
    /// Wrap an already held lock
    pub fn new(lock: SlotLock, jail: JailConfig, helper: PathBuf) -> Self {
        let slot_dir = jail.base_dir.join(lock.name());
        Self {
            lock,
            jail,
            helper,
            slot_dir,
            home_dir: None,
            source_dir: None,
        }
    }

    /// Lock the first free slot of the configured pool
    pub fn acquire(config: &SandboxConfig) -> Result<Self> {
        let helper = config.helper_path()?;
        let backend = Arc::new(DirLockBackend::new(
            config.jail.base_dir.clone(),
            config.jail.slot_prefix.clone(),
        ));
        let lock = SlotLock::acquire(backend)?;
        Ok(Self::new(lock, config.jail.clone(), helper))
    }

    pub fn id(&self) -> u32 {
        self.lock.id()
    }

    pub fn name(&self) -> &str {
        self.lock.name()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.slot_dir.join(SCRATCH_DIR_NAME)
    }

    /// Staged home directory, once `stage` succeeded
    pub fn home_dir(&self) -> Option<&Path> {
        self.home_dir.as_deref()
    }

    /// Directory results are copied back to
    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }

    fn transfer(&self, to: Ownership) -> std::result::Result<(), String> {
        ExternalCommand::new(
            self.helper.to_string_lossy().into_owned(),
            vec![to.flag().to_string(), self.id().to_string()],
        )
        .status()
    }

    /// Copy `source` into the slot and hand it to the jailed identity
    pub fn stage(&mut self, source: &Path) -> Result<()> {
        let slot = self.id();
        let failed = |step: StagingStep| move |detail: String| SandboxError::StagingFailed {
            slot,
            step,
            detail,
        };

        let source = fs::canonicalize(source).map_err(|e| {
            failed(StagingStep::CopyIn)(format!("{}: {}", source.display(), e))
        })?;

        ExternalOutcome::classify(self.transfer(Ownership::Control), FailurePolicy::Fatal)
            .into_result("Taking jail ownership", failed(StagingStep::TakeOwnership))?;

        let scratch = self.scratch_dir();
        ExternalOutcome::classify(
            remove_tree(&scratch).map_err(|e| format!("{}: {}", scratch.display(), e)),
            FailurePolicy::Fatal,
        )
        .into_result("Clearing scratch area", failed(StagingStep::ClearScratch))?;

        let home_dir = scratch.join(self.jail.home_relative());
        let copied = home_dir
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| copy_tree(&source, &home_dir))
            .map_err(|e| {
                format!(
                    "copying '{}' to '{}': {}",
                    source.display(),
                    home_dir.display(),
                    e
                )
            });
        ExternalOutcome::classify(copied, FailurePolicy::Fatal)
            .into_result("Copying working directory", failed(StagingStep::CopyIn))?;

        ExternalOutcome::classify(self.transfer(Ownership::Jailed), FailurePolicy::Fatal)
            .into_result("Giving jail ownership", failed(StagingStep::GiveOwnership))?;

        log::info!(
            "Staged {} ({} entries) into jail {}",
            source.display(),
            tree_listing(&home_dir).map(|l| l.len()).unwrap_or(0),
            self.name()
        );
        self.home_dir = Some(home_dir);
        self.source_dir = Some(source);
        Ok(())
    }

    /// Prefix that runs a command as the jailed identity in the staged home
    pub fn invocation_prefix(&self) -> String {
        self.jail.invocation_prefix(self.name())
    }

    /// Copy the staged home back over the original working directory
    pub fn retrieve(&mut self) -> Result<()> {
        let slot = self.id();
        let failed = move |detail: String| SandboxError::RetrieveFailed { slot, detail };

        let (Some(home_dir), Some(source_dir)) = (self.home_dir.clone(), self.source_dir.clone())
        else {
            return Err(failed("jail was never staged".to_string()));
        };

        ExternalOutcome::classify(
            remove_tree(&source_dir).map_err(|e| format!("{}: {}", source_dir.display(), e)),
            FailurePolicy::BestEffort,
        )
        .into_result("Removing old working directory", failed)?;

        ExternalOutcome::classify(self.transfer(Ownership::Control), FailurePolicy::Fatal)
            .into_result("Taking jail ownership", failed)?;

        let copied = copy_tree(&home_dir, &source_dir).map_err(|e| {
            format!(
                "copying '{}' to '{}': {}",
                home_dir.display(),
                source_dir.display(),
                e
            )
        });
        ExternalOutcome::classify(copied, FailurePolicy::Fatal)
            .into_result("Copying results back", failed)?;

        log::info!("Retrieved {} from jail {}", source_dir.display(), self.name());
        Ok(())
    }

    /// Deliver `signal` to every process of the jailed identity
    pub fn signal(&self, signal: JailSignal) -> Result<()> {
        if !self.lock.is_locked() {
            return Err(SandboxError::LockNotHeld {
                slot: self.name().to_string(),
            });
        }

        let command = ExternalCommand::parse(&self.jail.signal_command(self.name(), signal))?;
        log::debug!("Sending {} to jail {}", signal, self.name());
        command
            .run(FailurePolicy::Fatal)
            .into_result("Signal delivery", |detail| SandboxError::SignalDeliveryFailed {
                slot: self.name().to_string(),
                signal,
                detail,
            })
    }

    /// Kill everything in the jail
    ///
    /// CONT follows KILL so that stopped processes get to act on the kill.
    /// Delivery order across processes is not confirmed.
    pub fn kill(&self) -> Result<()> {
        self.signal(JailSignal::Kill)?;
        self.signal(JailSignal::Cont)
    }

    pub fn pause(&self) -> Result<()> {
        self.signal(JailSignal::Stop)
    }

    pub fn resume(&self) -> Result<()> {
        self.signal(JailSignal::Cont)
    }

    /// Return the slot to the pool
    pub fn release(&mut self) -> Result<()> {
        self.lock.release()
    }

    /// Leave the slot locked for manual inspection
    pub fn abandon(self) {
        self.lock.abandon();
    }
}
