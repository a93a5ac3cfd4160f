//! Global qvm configuration.
//!
//! Configuration is stored as TOML in the user's config directory. Every key
//! has a default, so a partial (or missing) file is valid.

use crate::error::{Error, Result};
use crate::paths::VmClass;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config/data directories.
const APP_NAME: &str = "qvm";

/// Config file name inside the application config directory.
const CONFIG_FILE: &str = "config.toml";

/// Global qvm configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QvmConfig {
    /// Where VM namespaces live.
    pub paths: PathsConfig,

    /// Session tracking tunables.
    pub session: SessionConfig,

    /// Firmware variable store settings.
    pub firmware: FirmwareConfig,
}

/// Directory layout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory containing the per-class VM directories.
    pub root: PathBuf,
    /// Directory name for Linux guests.
    pub linux: String,
    /// Directory name for macOS guests.
    pub macos: String,
    /// Directory name for Windows guests.
    pub windows: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .map(|d| d.join(APP_NAME))
            .unwrap_or_else(|| PathBuf::from(APP_NAME));

        Self {
            root,
            linux: "vms_linux".to_string(),
            macos: "vms_macos".to_string(),
            windows: "vms_windows".to_string(),
        }
    }
}

/// Which on-disk session format to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Probe the namespace root once at startup.
    #[default]
    Auto,
    /// `session.json` plus legacy mirror files.
    Structured,
    /// Legacy `qemu.pid` / `session.info` files only.
    Legacy,
}

/// Session tracking tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session persistence format.
    pub backend: BackendChoice,
    /// Run the stale sweep in the background for the manager's lifetime.
    pub background_sweep: bool,
    /// Interval between background stale sweeps.
    pub sweep_interval_secs: u64,
    /// Heartbeat age after which a live session is considered stale.
    pub heartbeat_timeout_secs: u64,
    /// Heartbeat age that produces an integrity warning.
    pub heartbeat_warn_secs: u64,
    /// Session age that produces an integrity warning.
    pub session_age_warn_secs: u64,
    /// Age after which a VM lock file is considered orphaned.
    pub lock_max_age_secs: u64,
    /// Liveness polls after SIGTERM before escalating to SIGKILL.
    pub stop_poll_attempts: u32,
    /// Delay between liveness polls while stopping.
    pub stop_poll_interval_ms: u64,
    /// Pause after SIGKILL before artifacts are removed.
    pub kill_settle_ms: u64,
    /// Upper bound on waiting for the sweep thread at shutdown.
    pub shutdown_join_timeout_secs: u64,
    /// SSH port assumed for recovered sessions with no port forward.
    pub default_ssh_port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            background_sweep: true,
            sweep_interval_secs: 300,
            heartbeat_timeout_secs: 24 * 60 * 60,
            heartbeat_warn_secs: 60 * 60,
            session_age_warn_secs: 7 * 24 * 60 * 60,
            lock_max_age_secs: 60 * 60,
            stop_poll_attempts: 10,
            stop_poll_interval_ms: 1000,
            kill_settle_ms: 500,
            shutdown_join_timeout_secs: 5,
            default_ssh_port: 2222,
        }
    }
}

impl SessionConfig {
    /// Background sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Heartbeat staleness threshold.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Heartbeat warning threshold.
    pub fn heartbeat_warn(&self) -> Duration {
        Duration::from_secs(self.heartbeat_warn_secs)
    }

    /// Session age warning threshold.
    pub fn session_age_warn(&self) -> Duration {
        Duration::from_secs(self.session_age_warn_secs)
    }

    /// Orphaned lock threshold.
    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }

    /// Delay between stop polls.
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// Pause after a forced kill.
    pub fn kill_settle(&self) -> Duration {
        Duration::from_millis(self.kill_settle_ms)
    }

    /// Join timeout for the sweep thread.
    pub fn shutdown_join_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_join_timeout_secs)
    }
}

/// Firmware variable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Candidate clean UEFI variable templates, first existing wins.
    pub vars_templates: Vec<PathBuf>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            vars_templates: [
                "/usr/share/edk2/x64/OVMF_VARS.4m.fd",
                "/usr/share/edk2/x64/OVMF_VARS.fd",
                "/usr/share/OVMF/OVMF_VARS_4M.fd",
                "/usr/share/OVMF/OVMF_VARS.fd",
                "/usr/share/edk2-ovmf/x64/OVMF_VARS.fd",
                "/usr/share/edk2/ovmf/OVMF_VARS.fd",
                "/usr/share/qemu/edk2-i386-vars.fd",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

impl FirmwareConfig {
    /// First configured template that exists on this host.
    pub fn find_template(&self) -> Option<&Path> {
        self.vars_templates
            .iter()
            .map(PathBuf::as_path)
            .find(|p| p.is_file())
    }
}

impl QvmConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::config("could not determine config directory"))?;
        Ok(dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::ConfigLoad(format!("{}: {}", path.display(), e))),
        }
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::storage(parent, e))?;
        }
        std::fs::write(path, text).map_err(|e| Error::ConfigSave(e.to_string()))
    }

    /// Namespace directory for a VM class.
    pub fn vms_dir(&self, class: VmClass) -> PathBuf {
        let name = match class {
            VmClass::Linux => &self.paths.linux,
            VmClass::Macos => &self.paths.macos,
            VmClass::Windows => &self.paths.windows,
        };
        self.paths.root.join(name)
    }

    /// Configuration rooted at `root`, with defaults for everything else.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.paths.root = root.into();
        config
    }
}
