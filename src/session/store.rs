//! Durable session persistence.
//!
//! Two on-disk formats exist. The structured format is a `session.json`
//! document holding the full [`SessionRecord`]; the legacy format is a pair of
//! single-value files (`qemu.pid`, `session.info`) that older tooling reads.
//! The structured backend writes both so older readers keep working, and falls
//! back to the legacy files when the document is unreadable.

use super::record::SessionRecord;
use crate::config::BackendChoice;
use crate::error::{Error, Result};
use crate::paths::{remove_if_exists, VmPaths};
use crate::process::Pid;
use std::io::Write;
use std::path::Path;

/// A session persistence format.
pub trait SessionBackend: Send + Sync {
    /// Backend name (e.g., "structured", "legacy").
    fn name(&self) -> &'static str;

    /// Persist a record. Partial writes surface as errors.
    fn save(&self, paths: &VmPaths, record: &SessionRecord) -> Result<()>;

    /// Load a record, degrading rather than failing on corrupt data.
    fn load(&self, paths: &VmPaths) -> Option<SessionRecord>;

    /// Remove every session artifact. Returns true if anything was removed.
    fn delete(&self, paths: &VmPaths) -> Result<bool> {
        let mut removed = false;
        for file in paths.session_artifacts() {
            removed |= remove_if_exists(&file)?;
        }
        Ok(removed)
    }

    /// Whether any session artifact exists.
    fn has_artifacts(&self, paths: &VmPaths) -> bool {
        paths.session_artifacts().iter().any(|p| p.exists())
    }
}

/// `session.json` plus legacy mirror files.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredBackend;

impl StructuredBackend {
    fn write_document(paths: &VmPaths, record: &SessionRecord) -> Result<()> {
        let target = paths.session_data();
        let wrap = |e: std::io::Error| Error::session_write(&record.vm_name, &target, e);

        let json = serde_json::to_vec_pretty(record)?;
        let mut tmp = tempfile::NamedTempFile::new_in(paths.dir()).map_err(wrap)?;
        tmp.write_all(&json).map_err(wrap)?;
        tmp.as_file().sync_all().map_err(wrap)?;
        tmp.persist(&target).map_err(|e| wrap(e.error))?;
        Ok(())
    }

    fn read_document(paths: &VmPaths) -> Option<SessionRecord> {
        let path = paths.session_data();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable session document");
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt session document");
                None
            }
        }
    }
}

impl SessionBackend for StructuredBackend {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn save(&self, paths: &VmPaths, record: &SessionRecord) -> Result<()> {
        Self::write_document(paths, record)?;
        write_legacy(paths, record)
    }

    fn load(&self, paths: &VmPaths) -> Option<SessionRecord> {
        Self::read_document(paths).or_else(|| read_legacy(paths))
    }
}

/// Legacy single-value files only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyBackend;

impl SessionBackend for LegacyBackend {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn save(&self, paths: &VmPaths, record: &SessionRecord) -> Result<()> {
        write_legacy(paths, record)
    }

    fn load(&self, paths: &VmPaths) -> Option<SessionRecord> {
        read_legacy(paths)
    }
}

fn write_legacy(paths: &VmPaths, record: &SessionRecord) -> Result<()> {
    let pid_file = paths.pid_file();
    std::fs::write(&pid_file, record.pid.to_string())
        .map_err(|e| Error::session_write(&record.vm_name, &pid_file, e))?;

    let info_file = paths.session_info();
    std::fs::write(&info_file, record.ssh_port.to_string())
        .map_err(|e| Error::session_write(&record.vm_name, &info_file, e))
}

fn read_value<T: std::str::FromStr>(path: &Path) -> Option<T> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Build a degraded record from `qemu.pid` + `session.info`.
///
/// Identity comes from `session.id` when present, otherwise it is unknown.
fn read_legacy(paths: &VmPaths) -> Option<SessionRecord> {
    let pid: Pid = read_value(&paths.pid_file())?;
    let ssh_port: u16 = read_value(&paths.session_info())?;

    let vm_name = paths
        .dir()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut record = SessionRecord::degraded(vm_name, pid, ssh_port);

    if let Ok(text) = std::fs::read_to_string(paths.session_id()) {
        let mut lines = text.lines().map(str::trim);
        if let (Some(uuid), Some(mac)) = (lines.next(), lines.next()) {
            if !uuid.is_empty() && !mac.is_empty() {
                record.uuid = uuid.to_string();
                record.mac_address = mac.to_string();
            }
        }
    }

    tracing::debug!(vm = %record.vm_name, pid, "loaded session from legacy files");
    Some(record)
}

/// Pick the backend once for a namespace.
///
/// `Auto` probes whether a temp document can be created and renamed inside the
/// namespace root; if it cannot, plain legacy writes are used instead.
pub fn select_backend(choice: BackendChoice, vms_dir: &Path) -> Box<dyn SessionBackend> {
    let backend: Box<dyn SessionBackend> = match choice {
        BackendChoice::Structured => Box::new(StructuredBackend),
        BackendChoice::Legacy => Box::new(LegacyBackend),
        BackendChoice::Auto => {
            if supports_atomic_documents(vms_dir) {
                Box::new(StructuredBackend)
            } else {
                Box::new(LegacyBackend)
            }
        }
    };
    tracing::debug!(backend = backend.name(), dir = %vms_dir.display(), "selected session backend");
    backend
}

fn supports_atomic_documents(vms_dir: &Path) -> bool {
    // Nothing to probe yet; the namespace will be created by the first VM.
    if !vms_dir.exists() {
        return true;
    }

    let probe = vms_dir.join(".qvm-probe");
    let ok = tempfile::NamedTempFile::new_in(vms_dir)
        .and_then(|tmp| tmp.persist(&probe).map_err(|e| e.error))
        .is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}

/// Session persistence for one namespace.
pub struct SessionStore {
    vms_dir: std::path::PathBuf,
    backend: Box<dyn SessionBackend>,
}

impl SessionStore {
    /// Create a store over `vms_dir` using `backend`.
    pub fn new(vms_dir: impl Into<std::path::PathBuf>, backend: Box<dyn SessionBackend>) -> Self {
        Self {
            vms_dir: vms_dir.into(),
            backend,
        }
    }

    /// Namespace directory.
    pub fn vms_dir(&self) -> &Path {
        &self.vms_dir
    }

    /// Active backend name.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Paths for a VM in this namespace.
    pub fn paths(&self, vm_name: &str) -> Result<VmPaths> {
        VmPaths::new(&self.vms_dir, vm_name)
    }

    /// Persist a record.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let paths = self.paths(&record.vm_name)?;
        self.backend.save(&paths, record)
    }

    /// Load a record. Invalid names and unreadable data yield `None`.
    pub fn load(&self, vm_name: &str) -> Option<SessionRecord> {
        let paths = self.paths(vm_name).ok()?;
        self.backend.load(&paths).map(|mut record| {
            record.vm_name = vm_name.to_string();
            record
        })
    }

    /// Remove all artifacts. Already-absent sessions are not an error.
    pub fn delete(&self, vm_name: &str) -> Result<bool> {
        let paths = self.paths(vm_name)?;
        self.backend.delete(&paths)
    }

    /// Whether any session artifact exists for the VM.
    pub fn has_artifacts(&self, vm_name: &str) -> bool {
        self.paths(vm_name)
            .map(|p| self.backend.has_artifacts(&p))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::record::UNKNOWN;
    use tempfile::TempDir;

    fn setup(vm: &str) -> (TempDir, VmPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(dir.path(), vm).unwrap();
        std::fs::create_dir_all(paths.dir()).unwrap();
        (dir, paths)
    }

    #[test]
    fn test_structured_save_writes_both_formats() {
        let (_dir, paths) = setup("alpha");
        let record = SessionRecord::new("alpha", 4321, 2222, "u1", "52:54:00:11:22:33");
        StructuredBackend.save(&paths, &record).unwrap();

        assert!(paths.session_data().exists());
        assert_eq!(std::fs::read_to_string(paths.pid_file()).unwrap(), "4321");
        assert_eq!(std::fs::read_to_string(paths.session_info()).unwrap(), "2222");

        let loaded = StructuredBackend.load(&paths).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_corrupt_document_falls_back_to_legacy() {
        let (_dir, paths) = setup("beta");
        let record = SessionRecord::new("beta", 77, 2201, "u1", "52:54:00:11:22:33");
        StructuredBackend.save(&paths, &record).unwrap();
        std::fs::write(paths.session_data(), "{ not json").unwrap();

        let loaded = StructuredBackend.load(&paths).unwrap();
        assert_eq!(loaded.pid, 77);
        assert_eq!(loaded.ssh_port, 2201);
        assert_eq!(loaded.uuid, UNKNOWN);
        assert_eq!(loaded.mac_address, UNKNOWN);
    }

    #[test]
    fn test_legacy_load_reads_session_id() {
        let (_dir, paths) = setup("gamma");
        std::fs::write(paths.pid_file(), "12\n").unwrap();
        std::fs::write(paths.session_info(), " 2300 ").unwrap();
        std::fs::write(paths.session_id(), "uuid-x\n52:54:00:aa:bb:cc\n").unwrap();

        let loaded = LegacyBackend.load(&paths).unwrap();
        assert_eq!(loaded.vm_name, "gamma");
        assert_eq!(loaded.pid, 12);
        assert_eq!(loaded.ssh_port, 2300);
        assert_eq!(loaded.uuid, "uuid-x");
        assert_eq!(loaded.mac_address, "52:54:00:aa:bb:cc");
    }

    #[test]
    fn test_legacy_load_needs_both_files() {
        let (_dir, paths) = setup("delta");
        std::fs::write(paths.pid_file(), "12").unwrap();
        assert!(LegacyBackend.load(&paths).is_none());
        std::fs::write(paths.session_info(), "not-a-port").unwrap();
        assert!(LegacyBackend.load(&paths).is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, paths) = setup("eps");
        let record = SessionRecord::new("eps", 1, 2222, "u", "m");
        StructuredBackend.save(&paths, &record).unwrap();

        assert!(StructuredBackend.delete(&paths).unwrap());
        assert!(!StructuredBackend.has_artifacts(&paths));
        assert!(!StructuredBackend.delete(&paths).unwrap());
    }

    #[test]
    fn test_save_into_missing_dir_is_session_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(dir.path(), "ghost").unwrap();
        let record = SessionRecord::new("ghost", 1, 0, "u", "m");
        let err = StructuredBackend.save(&paths, &record).unwrap_err();
        assert!(matches!(err, Error::SessionWrite { .. }));
    }

    #[test]
    fn test_select_backend() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(select_backend(BackendChoice::Legacy, dir.path()).name(), "legacy");
        assert_eq!(
            select_backend(BackendChoice::Structured, dir.path()).name(),
            "structured"
        );
        assert_eq!(select_backend(BackendChoice::Auto, dir.path()).name(), "structured");
        assert!(!dir.path().join(".qvm-probe").exists());
    }

    #[test]
    fn test_store_load_uses_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), Box::new(StructuredBackend));
        std::fs::create_dir(dir.path().join("zeta")).unwrap();

        let mut record = SessionRecord::new("zeta", 5, 0, "u", "m");
        store.save(&record).unwrap();
        // A document copied from another VM still resolves to this VM.
        record.vm_name = "other".into();
        let paths = store.paths("zeta").unwrap();
        StructuredBackend.save(&paths, &record).unwrap();
        assert_eq!(store.load("zeta").unwrap().vm_name, "zeta");
        assert!(store.load("../escape").is_none());
    }
}
