//! Error types for qvm.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using qvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in qvm operations.
#[derive(Error, Debug)]
pub enum Error {
    // VM errors
    /// VM directory does not exist in the namespace.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// VM name cannot be used as a directory name.
    #[error("invalid vm name {name:?}: {reason}")]
    InvalidVmName {
        /// Offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    // Process errors
    /// The process is not alive (or is a zombie).
    #[error("process {pid} is not running")]
    ProcessNotRunning {
        /// Process id that was checked.
        pid: i32,
    },

    /// Delivering a signal failed for a reason other than the process being gone.
    #[error("failed to send signal {signal} to pid {pid}: {source}")]
    Signal {
        /// Target process id.
        pid: i32,
        /// Signal number.
        signal: i32,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// A VM could not be stopped.
    #[error("failed to stop vm {vm}: {reason}")]
    StopFailed {
        /// VM name.
        vm: String,
        /// What went wrong, usually the classified signal failure.
        reason: String,
    },

    // Session errors
    /// Writing session artifacts failed.
    #[error("failed to write session for vm {vm} at {}: {source}", path.display())]
    SessionWrite {
        /// VM name.
        vm: String,
        /// File that could not be written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    // Storage errors
    /// Filesystem operation on a VM artifact failed.
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Firmware errors
    /// No clean UEFI variable template exists on the host.
    #[error("no UEFI variable template found (searched: {})", display_paths(searched))]
    FirmwareTemplateMissing {
        /// Candidate paths that were checked.
        searched: Vec<PathBuf>,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a storage error for a path.
    pub fn storage(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a session write error.
    pub fn session_write(
        vm: impl Into<String>,
        path: impl AsRef<Path>,
        source: std::io::Error,
    ) -> Self {
        Self::SessionWrite {
            vm: vm.into(),
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create an invalid VM name error.
    pub fn invalid_vm_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVmName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The IO error kind behind this error, if any.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Error::Signal { source, .. }
            | Error::SessionWrite { source, .. }
            | Error::Storage { source, .. }
            | Error::Io(source) => Some(source.kind()),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
