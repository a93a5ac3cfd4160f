//! VM namespaces and per-VM file layout.
//!
//! Each VM lives in its own directory under a namespace root. All session and
//! identity artifacts for that VM are files inside that directory:
//!
//! ```text
//! vms_linux/
//! └── {vm_name}/
//!     ├── session.json        # Structured session document
//!     ├── qemu.pid            # Legacy: bare pid
//!     ├── session.info        # Legacy: bare ssh port
//!     ├── session.id          # Legacy: uuid + mac, one per line
//!     ├── identifiers.json    # Identifier bundle
//!     ├── uefi-seed.fd        # Clean UEFI variable copy
//!     ├── uefi-instance.fd    # Live UEFI variables
//!     └── shared/             # Host/guest shared directory
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Structured session document.
pub const SESSION_DATA_FILE: &str = "session.json";

/// Legacy pid file.
pub const PID_FILE: &str = "qemu.pid";

/// Legacy ssh port file.
pub const SESSION_INFO_FILE: &str = "session.info";

/// Legacy identity file.
pub const SESSION_ID_FILE: &str = "session.id";

/// Identifier bundle document.
pub const IDENTIFIERS_FILE: &str = "identifiers.json";

/// UEFI variable seed (template copy).
pub const UEFI_SEED_FILE: &str = "uefi-seed.fd";

/// UEFI variable live instance.
pub const UEFI_INSTANCE_FILE: &str = "uefi-instance.fd";

/// Lock files that may be left behind by crashed launches.
pub const LOCK_FILES: [&str; 3] = ["qemu.lock", "session.lock", ".session_lock"];

/// Guest operating system class. Each class is a separate VM namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmClass {
    /// Linux guests.
    #[default]
    Linux,
    /// macOS guests.
    Macos,
    /// Windows guests.
    Windows,
}

impl std::fmt::Display for VmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmClass::Linux => write!(f, "linux"),
            VmClass::Macos => write!(f, "macos"),
            VmClass::Windows => write!(f, "windows"),
        }
    }
}

/// Paths for one VM directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    dir: PathBuf,
}

impl VmPaths {
    /// Paths for `vm_name` inside `vms_dir`.
    ///
    /// The name is validated so it cannot escape the namespace.
    pub fn new(vms_dir: &Path, vm_name: &str) -> Result<Self> {
        validate_vm_name(vm_name)?;
        Ok(Self {
            dir: vms_dir.join(vm_name),
        })
    }

    /// VM directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the VM directory exists.
    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Structured session document.
    pub fn session_data(&self) -> PathBuf {
        self.dir.join(SESSION_DATA_FILE)
    }

    /// Legacy pid file.
    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    /// Legacy ssh port file.
    pub fn session_info(&self) -> PathBuf {
        self.dir.join(SESSION_INFO_FILE)
    }

    /// Legacy identity file.
    pub fn session_id(&self) -> PathBuf {
        self.dir.join(SESSION_ID_FILE)
    }

    /// Every file that makes up a session, in removal order.
    pub fn session_artifacts(&self) -> [PathBuf; 3] {
        [self.pid_file(), self.session_info(), self.session_data()]
    }

    /// Identifier bundle document.
    pub fn identifiers(&self) -> PathBuf {
        self.dir.join(IDENTIFIERS_FILE)
    }

    /// UEFI variable seed.
    pub fn uefi_seed(&self) -> PathBuf {
        self.dir.join(UEFI_SEED_FILE)
    }

    /// UEFI live variable store.
    pub fn uefi_instance(&self) -> PathBuf {
        self.dir.join(UEFI_INSTANCE_FILE)
    }

    /// Host/guest shared directory.
    pub fn shared_dir(&self) -> PathBuf {
        self.dir.join("shared")
    }

    /// Lock files that may exist for this VM.
    pub fn lock_files(&self) -> impl Iterator<Item = PathBuf> + '_ {
        LOCK_FILES.iter().map(move |name| self.dir.join(name))
    }
}

/// Accept only names made of ASCII letters, digits, `.`, `_` and `-`.
///
/// VM names become directory names and guest host names, and are written
/// into the guest identity script.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_vm_name(name, "name is empty"));
    }
    if name == "." || name == ".." {
        return Err(Error::invalid_vm_name(name, "name is a relative path component"));
    }
    if name.contains('/') {
        return Err(Error::invalid_vm_name(name, "name contains a path separator"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::invalid_vm_name(
            name,
            "name may only contain letters, digits, '.', '_' and '-'",
        ));
    }
    Ok(())
}

/// Names of all VM directories in a namespace, sorted.
///
/// A missing namespace directory yields an empty list.
pub fn list_vm_names(vms_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(vms_dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Remove a file, treating "already gone" as success.
///
/// Returns true if a file was actually removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::storage(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_paths() {
        let paths = VmPaths::new(Path::new("/vms"), "alpha").unwrap();
        assert_eq!(paths.dir(), Path::new("/vms/alpha"));
        assert_eq!(paths.session_data(), PathBuf::from("/vms/alpha/session.json"));
        assert_eq!(paths.pid_file(), PathBuf::from("/vms/alpha/qemu.pid"));
        assert_eq!(paths.session_info(), PathBuf::from("/vms/alpha/session.info"));
        assert_eq!(paths.identifiers(), PathBuf::from("/vms/alpha/identifiers.json"));
        assert_eq!(paths.lock_files().count(), 3);
    }

    #[test]
    fn test_vm_name_validation() {
        for bad in [
            "",
            ".",
            "..",
            "a/b",
            "../etc",
            "nul\0byte",
            "web$(touch x)",
            "web`id`",
            "quote\"d",
            "two words",
        ] {
            assert!(VmPaths::new(Path::new("/vms"), bad).is_err(), "{:?}", bad);
        }
        assert!(validate_vm_name("ubuntu-24.04").is_ok());
        assert!(validate_vm_name("win_11").is_ok());
    }

    #[test]
    fn test_list_vm_names_skips_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(list_vm_names(dir.path()), vec!["a", "b"]);
        assert!(list_vm_names(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_remove_if_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("qemu.pid");
        std::fs::write(&file, "1").unwrap();
        assert!(remove_if_exists(&file).unwrap());
        assert!(!remove_if_exists(&file).unwrap());
    }
}
