/// Sandbox configuration and discovery of the optional server info file
use crate::types::{JailSignal, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit server info file
pub const SERVER_INFO_ENV: &str = "JAILBOX_SERVER_INFO";

/// Server info file looked up in the current directory
const DEFAULT_SERVER_INFO: &str = "server_info.json";

/// Helper location relative to the resource repository
const HELPER_RELATIVE_PATH: &str = "worker/jail_own";

/// Host-provided server description
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Run commands inside a jail unless told otherwise
    #[serde(default = "default_secure_jail")]
    pub secure_jail: bool,
    /// Resource repository holding the ownership-transfer helper
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    /// Jail pool settings
    #[serde(default)]
    pub jail: JailConfig,
}

fn default_secure_jail() -> bool {
    true
}

/// Jail pool layout and privileged command templates
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JailConfig {
    /// Directory holding the slot directories
    pub base_dir: PathBuf,
    /// Name prefix of slot directories; the rest of the name is the slot id
    pub slot_prefix: String,
    /// Identity the command runs as inside the jail
    pub jailed_user: String,
    /// Ownership-transfer helper; derived from the repo path when unset
    pub helper: Option<PathBuf>,
    /// Prefix prepended to jailed commands
    pub invocation_template: String,
    /// Command delivering a signal to every jailed process
    pub signal_template: String,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/srv/chroot"),
            slot_prefix: "jailuser".to_string(),
            jailed_user: "jailuser".to_string(),
            helper: None,
            invocation_template: "sudo -u {slot} schroot -u {slot} -c {slot} -d {home} -- "
                .to_string(),
            signal_template: "sudo -u {slot} kill -{signal} -1".to_string(),
        }
    }
}

impl JailConfig {
    /// Staging location relative to a slot's scratch area
    pub fn home_relative(&self) -> PathBuf {
        Path::new("home").join(&self.jailed_user)
    }

    /// Home directory as seen from inside the jail
    pub fn jailed_home(&self) -> String {
        format!("/home/{}", self.jailed_user)
    }

    /// Invocation prefix for a slot
    pub fn invocation_prefix(&self, slot_name: &str) -> String {
        self.invocation_template
            .replace("{slot}", slot_name)
            .replace("{home}", &self.jailed_home())
    }

    /// Signal delivery command line for a slot
    pub fn signal_command(&self, slot_name: &str, signal: JailSignal) -> String {
        self.signal_template
            .replace("{slot}", slot_name)
            .replace("{signal}", signal.as_str())
    }
}

/// Configuration handed to every sandbox session
#[derive(Clone, Debug, Default)]
pub struct SandboxConfig {
    /// Mode used when the caller does not choose one
    pub secure_default: bool,
    /// Resource repository, if a server info file named one
    pub repo_path: Option<PathBuf>,
    /// Jail pool settings
    pub jail: JailConfig,
}

impl SandboxConfig {
    /// Locate and load server info; a missing file means insecure by default
    pub fn discover() -> Result<Self> {
        let path = std::env::var_os(SERVER_INFO_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_INFO));
        Self::from_file(&path)
    }

    /// Load from a specific server info file, tolerating its absence
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!(
                "No server info at {}, secure mode off by default",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let info: ServerInfo = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!("Invalid server info {}: {}", path.display(), e))
        })?;
        log::info!(
            "Loaded server info from {} (secure_jail={})",
            path.display(),
            info.secure_jail
        );
        Ok(Self::from(info))
    }

    /// Path of the ownership-transfer helper
    pub fn helper_path(&self) -> Result<PathBuf> {
        if let Some(ref helper) = self.jail.helper {
            return Ok(helper.clone());
        }
        self.repo_path
            .as_ref()
            .map(|repo| repo.join(HELPER_RELATIVE_PATH))
            .ok_or_else(|| {
                SandboxError::Config(
                    "Secure mode needs a repo_path or an explicit jail helper".to_string(),
                )
            })
    }
}

impl From<ServerInfo> for SandboxConfig {
    fn from(info: ServerInfo) -> Self {
        Self {
            secure_default: info.secure_jail,
            repo_path: info.repo_path,
            jail: info.jail,
        }
    }
}
