/// Slot locking over a fixed pool of pre-provisioned jails
///
/// The on-disk protocol: a slot is held while `<base>/<slot>/locked` exists.
/// Directory creation is atomic, so the first creator wins and everyone else
/// moves on to the next slot. The holder's pid goes into `locked/lock.pid`.
use crate::types::{Result, SandboxError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Lock marker directory inside a slot
pub const LOCK_DIR_NAME: &str = "locked";

/// Sentinel file inside the marker holding the owner pid
pub const LOCK_PID_FILE: &str = "lock.pid";

/// One slot of the pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Numeric id parsed from the slot name, used to address the helper
    pub id: u32,
    /// Directory name, also the jailed account name
    pub name: String,
}

/// Mutual-exclusion backend for the slot pool
pub trait LockBackend: Send + Sync {
    /// Every slot of the pool, in scan order
    fn candidates(&self) -> Result<Vec<Slot>>;

    /// Try to take a slot; `Ok(false)` means it is busy
    fn try_acquire(&self, slot: &Slot, owner: u32) -> Result<bool>;

    /// Give a slot back; fails unless `owner` is the recorded holder
    fn release(&self, slot: &Slot, owner: u32) -> Result<()>;

    /// Recorded holder of a slot, if locked
    fn owner(&self, slot: &Slot) -> Result<Option<u32>>;

    /// Human readable pool location for error messages
    fn describe(&self) -> String;
}

/// Filesystem backend using atomic directory creation
#[derive(Clone, Debug)]
pub struct DirLockBackend {
    base_dir: PathBuf,
    slot_prefix: String,
}

impl DirLockBackend {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(base_dir: P, slot_prefix: S) -> Self {
        Self {
            base_dir: base_dir.into(),
            slot_prefix: slot_prefix.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Marker directory of a slot
    pub fn lock_dir(&self, slot: &Slot) -> PathBuf {
        self.base_dir.join(&slot.name).join(LOCK_DIR_NAME)
    }

    fn pid_file(&self, slot: &Slot) -> PathBuf {
        self.lock_dir(slot).join(LOCK_PID_FILE)
    }

    fn read_pid(&self, slot: &Slot) -> Result<u32> {
        let content = fs::read_to_string(self.pid_file(slot))?;
        content
            .trim()
            .parse::<u32>()
            .map_err(|e| SandboxError::LockCorrupted {
                slot: slot.name.clone(),
                detail: format!("bad pid '{}': {}", content.trim(), e),
            })
    }
}

impl LockBackend for DirLockBackend {
    fn candidates(&self) -> Result<Vec<Slot>> {
        let mut slots = Vec::new();

        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(suffix) = name.strip_prefix(&self.slot_prefix) else {
                continue;
            };
            match suffix.parse::<u32>() {
                Ok(id) if entry.file_type()?.is_dir() => slots.push(Slot {
                    id,
                    name: name.to_string(),
                }),
                _ => log::debug!("Ignoring {} in jail pool", name),
            }
        }

        slots.sort_by_key(|slot| slot.id);
        Ok(slots)
    }

    fn try_acquire(&self, slot: &Slot, owner: u32) -> Result<bool> {
        let lock_dir = self.lock_dir(slot);

        match fs::create_dir(&lock_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                log::warn!("Cannot lock jail {}: {}", slot.name, e);
                return Ok(false);
            }
        }

        let written = File::create(self.pid_file(slot)).and_then(|mut pid_file| {
            write!(pid_file, "{}", owner)?;
            pid_file.sync_all()
        });
        if let Err(e) = written {
            // Nobody else can own the marker yet, so undo it before bailing out
            let _ = fs::remove_file(self.pid_file(slot));
            let _ = fs::remove_dir(&lock_dir);
            return Err(SandboxError::Io(e));
        }

        Ok(true)
    }

    fn release(&self, slot: &Slot, owner: u32) -> Result<()> {
        if !self.lock_dir(slot).is_dir() {
            return Err(SandboxError::LockNotHeld {
                slot: slot.name.clone(),
            });
        }

        let lock_pid = self.read_pid(slot)?;
        if lock_pid != owner {
            return Err(SandboxError::LockOwnershipViolation {
                slot: slot.name.clone(),
                lock_pid,
                release_pid: owner,
            });
        }

        fs::remove_file(self.pid_file(slot))?;
        fs::remove_dir(self.lock_dir(slot))?;
        Ok(())
    }

    fn owner(&self, slot: &Slot) -> Result<Option<u32>> {
        if !self.lock_dir(slot).is_dir() {
            return Ok(None);
        }
        self.read_pid(slot).map(Some)
    }

    fn describe(&self) -> String {
        self.base_dir.display().to_string()
    }
}

/// In-process backend for tests and single-host tooling
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    slots: Vec<Slot>,
    held: Mutex<HashMap<u32, u32>>,
}

impl MemoryLockBackend {
    /// Pool of `count` slots named `<prefix>0..count`
    pub fn with_slots(count: u32, prefix: &str) -> Self {
        Self {
            slots: (0..count)
                .map(|id| Slot {
                    id,
                    name: format!("{}{}", prefix, id),
                })
                .collect(),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn held(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u32, u32>>> {
        self.held
            .lock()
            .map_err(|e| SandboxError::Config(format!("Lock table poisoned: {}", e)))
    }
}

impl LockBackend for MemoryLockBackend {
    fn candidates(&self) -> Result<Vec<Slot>> {
        Ok(self.slots.clone())
    }

    fn try_acquire(&self, slot: &Slot, owner: u32) -> Result<bool> {
        let mut held = self.held()?;
        if held.contains_key(&slot.id) {
            return Ok(false);
        }
        held.insert(slot.id, owner);
        Ok(true)
    }

    fn release(&self, slot: &Slot, owner: u32) -> Result<()> {
        let mut held = self.held()?;
        match held.get(&slot.id).copied() {
            None => Err(SandboxError::LockNotHeld {
                slot: slot.name.clone(),
            }),
            Some(lock_pid) if lock_pid != owner => Err(SandboxError::LockOwnershipViolation {
                slot: slot.name.clone(),
                lock_pid,
                release_pid: owner,
            }),
            Some(_) => {
                held.remove(&slot.id);
                Ok(())
            }
        }
    }

    fn owner(&self, slot: &Slot) -> Result<Option<u32>> {
        Ok(self.held()?.get(&slot.id).copied())
    }

    fn describe(&self) -> String {
        format!("in-memory pool of {} slots", self.slots.len())
    }
}

/// Locked slots and their recorded holders (for listing and stale-lock diagnosis)
pub fn held_slots(backend: &dyn LockBackend) -> Result<Vec<(Slot, u32)>> {
    let mut held = Vec::new();
    for slot in backend.candidates()? {
        if let Some(pid) = backend.owner(&slot)? {
            held.push((slot, pid));
        }
    }
    Ok(held)
}

/// Exclusive hold on one slot of the pool
///
/// Must be released explicitly; dropping a held lock is reported as an error
/// and leaves the slot locked on disk.
pub struct SlotLock {
    backend: Arc<dyn LockBackend>,
    slot: Slot,
    owner: u32,
    locked: bool,
    acquired_at: DateTime<Utc>,
}

impl SlotLock {
    /// Lock the first free slot on behalf of this process
    pub fn acquire(backend: Arc<dyn LockBackend>) -> Result<Self> {
        Self::acquire_as(backend, std::process::id())
    }

    /// Lock the first free slot on behalf of `owner`
    pub fn acquire_as(backend: Arc<dyn LockBackend>, owner: u32) -> Result<Self> {
        for slot in backend.candidates()? {
            if backend.try_acquire(&slot, owner)? {
                log::info!("Locked jail {} (id {}) for pid {}", slot.name, slot.id, owner);
                return Ok(Self {
                    backend,
                    slot,
                    owner,
                    locked: true,
                    acquired_at: Utc::now(),
                });
            }
            log::debug!("Jail {} is busy", slot.name);
        }

        Err(SandboxError::NoAvailableSlot {
            base: backend.describe(),
        })
    }

    /// Return the slot to the pool
    pub fn release(&mut self) -> Result<()> {
        if !self.locked {
            return Err(SandboxError::LockNotHeld {
                slot: self.slot.name.clone(),
            });
        }

        self.backend.release(&self.slot, self.owner)?;
        self.locked = false;
        log::info!(
            "Released jail {} after {}s",
            self.slot.name,
            (Utc::now() - self.acquired_at).num_seconds()
        );
        Ok(())
    }

    /// Give up the hold without unlocking, leaving the marker for manual inspection
    pub fn abandon(mut self) {
        log::error!(
            "Leaving jail {} locked by pid {}; it needs manual cleanup before reuse",
            self.slot.name,
            self.owner
        );
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    pub fn id(&self) -> u32 {
        self.slot.id
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        if self.locked {
            log::error!(
                "Jail lock for {} freed without being released (owner pid {})",
                self.slot.name,
                self.owner
            );
        }
    }
}
