//! Session manager.
//!
//! The manager answers "is this VM running", stops VMs, reaps stale sessions
//! and recovers sessions whose bookkeeping was lost. The process table is the
//! final arbiter of liveness: the in-memory cache is only ever trusted after
//! the cached pid has been re-checked.

use super::integrity::{self, IntegrityReport};
use super::record::{SessionRecord, SessionStatus, UNKNOWN};
use super::store::{select_backend, SessionStore};
use super::sweeper::Sweeper;
use crate::config::{QvmConfig, SessionConfig};
use crate::diagnostics::{ErrorReport, ErrorReporter};
use crate::error::{Error, Result};
use crate::identity::IdentifierBundle;
use crate::paths::{self, VmClass};
use crate::process::{self, Delivery, Pid, Signal};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Runtime statistics for a running session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// VM name.
    pub vm_name: String,
    /// QEMU process id.
    pub pid: Pid,
    /// Forwarded SSH port.
    pub ssh_port: u16,
    /// Session start time.
    pub start_time: DateTime<Utc>,
    /// Seconds since the session started.
    pub uptime_secs: u64,
    /// Uptime rendered for humans (e.g. "2h 3m 4s").
    pub uptime: String,
    /// CPU usage in percent, if it could be sampled.
    pub cpu_percent: Option<f32>,
    /// Resident memory in MiB, if it could be sampled.
    pub memory_mb: Option<u64>,
    /// Active VM UUID.
    pub uuid: String,
    /// Active MAC address.
    pub mac_address: String,
    /// Session status.
    pub status: SessionStatus,
}

struct Inner {
    config: SessionConfig,
    store: SessionStore,
    cache: Mutex<HashMap<String, SessionRecord>>,
    reporter: ErrorReporter,
}

/// Tracks VM sessions in one namespace.
///
/// Construct one per namespace and pass it where it is needed. Dropping the
/// manager stops the background sweep and runs a final cleanup pass.
pub struct SessionManager {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<Sweeper>>,
    closed: AtomicBool,
}

impl SessionManager {
    /// Create a manager over `vms_dir`, warm the cache from disk and start
    /// the background sweep unless `background_sweep` is off.
    pub fn new(vms_dir: impl Into<PathBuf>, config: SessionConfig) -> Self {
        let vms_dir = vms_dir.into();
        let backend = select_backend(config.backend, &vms_dir);
        let inner = Arc::new(Inner {
            config,
            store: SessionStore::new(vms_dir, backend),
            cache: Mutex::new(HashMap::new()),
            reporter: ErrorReporter::new(),
        });

        let manager = Self {
            inner,
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        manager.inner.warm_cache();
        if manager.inner.config.background_sweep {
            if let Err(e) = manager.start_background_sweep() {
                manager
                    .inner
                    .reporter
                    .report(&e, &[("operation", "start_background_sweep")]);
            }
        }
        manager
    }

    /// Create a manager for a VM class using the global configuration.
    pub fn for_class(config: &QvmConfig, class: VmClass) -> Self {
        Self::new(config.vms_dir(class), config.session.clone())
    }

    /// Namespace directory.
    pub fn vms_dir(&self) -> &Path {
        self.inner.store.vms_dir()
    }

    /// Name of the session backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.inner.store.backend_name()
    }

    /// Session tunables.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Start tracking a freshly launched VM process.
    ///
    /// The VM directory must exist and `pid` must be running. Failures are
    /// classified, logged and returned.
    pub fn create_session(
        &self,
        vm_name: &str,
        pid: Pid,
        ssh_port: u16,
        uuid: &str,
        mac_address: &str,
        command_line: Option<String>,
    ) -> Result<SessionRecord> {
        self.inner
            .create_session(vm_name, pid, ssh_port, uuid, mac_address, command_line)
            .inspect_err(|err| {
                self.inner.reporter.report(
                    err,
                    &[("vm", vm_name), ("operation", "create_session")],
                );
            })
    }

    /// The session for a VM, if its process is running.
    ///
    /// A session whose process is gone is cleaned up and `None` returned.
    pub fn get_session_info(&self, vm_name: &str) -> Option<SessionRecord> {
        self.inner.get_session_info(vm_name)
    }

    /// Whether the VM has a running session.
    pub fn is_vm_running(&self, vm_name: &str) -> bool {
        self.get_session_info(vm_name).is_some()
    }

    /// Stop a VM, escalating from SIGTERM to SIGKILL.
    ///
    /// Returns false only if the process could not be signalled; session
    /// artifacts are kept in that case.
    pub fn stop_session(&self, vm_name: &str, force: bool) -> bool {
        self.inner.stop_session(vm_name, force)
    }

    /// Remove every stale session and orphaned lock. Returns the number of
    /// items cleaned.
    pub fn cleanup_stale_sessions(&self) -> usize {
        self.inner.cleanup_stale_sessions()
    }

    /// Every running session in the namespace.
    pub fn list_sessions(&self) -> BTreeMap<String, SessionRecord> {
        paths::list_vm_names(self.vms_dir())
            .into_iter()
            .filter_map(|vm| self.get_session_info(&vm).map(|s| (vm, s)))
            .collect()
    }

    /// Refresh the heartbeat of a cached running session.
    pub fn update_session_heartbeat(&self, vm_name: &str) -> bool {
        self.inner.update_session_heartbeat(vm_name)
    }

    /// Uptime and resource usage for a running session.
    pub fn get_session_stats(&self, vm_name: &str) -> Option<SessionStats> {
        let session = self.get_session_info(vm_name)?;
        let uptime_secs = session.age().num_seconds().max(0) as u64;
        let usage = process::usage(session.pid);

        Some(SessionStats {
            vm_name: session.vm_name,
            pid: session.pid,
            ssh_port: session.ssh_port,
            start_time: session.start_time,
            uptime_secs,
            uptime: humantime::format_duration(Duration::from_secs(uptime_secs)).to_string(),
            cpu_percent: usage.map(|u| u.cpu_percent),
            memory_mb: usage.map(|u| u.memory_bytes / (1024 * 1024)),
            uuid: session.uuid,
            mac_address: session.mac_address,
            status: session.status,
        })
    }

    /// Audit a session without changing anything.
    pub fn validate_session_integrity(&self, vm_name: &str) -> IntegrityReport {
        self.inner.validate(vm_name)
    }

    /// Rebuild a session for a VM whose process runs but is untracked.
    pub fn recover_session(&self, vm_name: &str) -> bool {
        self.inner.recover_session(vm_name)
    }

    /// Start the periodic stale sweep. Calling it again, or after
    /// [`shutdown`](Self::shutdown), is a no-op.
    pub fn start_background_sweep(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() || self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let inner = self.inner.clone();
        *sweeper = Some(Sweeper::spawn(self.inner.config.sweep_interval(), move || {
            let cleaned = inner.cleanup_stale_sessions();
            if cleaned > 0 {
                tracing::info!(cleaned, "background sweep cleaned stale sessions");
            }
        })?);
        Ok(())
    }

    /// Whether the background sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Stop the background sweep and run a final cleanup pass.
    ///
    /// Only the first call has any effect.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop(self.inner.config.shutdown_join_timeout());
        }

        let cleaned = self.inner.cleanup_stale_sessions();
        tracing::debug!(cleaned, "session manager shut down");
    }

    /// Recent classified errors, oldest first.
    pub fn recent_errors(&self, limit: Option<usize>) -> Vec<ErrorReport> {
        self.inner.reporter.recent(limit)
    }

    /// The manager's error reporter, for registering recovery handlers.
    pub fn reporter(&self) -> &ErrorReporter {
        &self.inner.reporter
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn warm_cache(&self) {
        let names = paths::list_vm_names(self.store.vms_dir());
        let live = names
            .iter()
            .filter(|vm| self.store.has_artifacts(vm))
            .filter(|vm| self.get_session_info(vm).is_some())
            .count();
        tracing::debug!(
            dir = %self.store.vms_dir().display(),
            backend = self.store.backend_name(),
            live,
            "session cache warmed"
        );
    }

    fn create_session(
        &self,
        vm_name: &str,
        pid: Pid,
        ssh_port: u16,
        uuid: &str,
        mac_address: &str,
        command_line: Option<String>,
    ) -> Result<SessionRecord> {
        let paths = self.store.paths(vm_name)?;
        if !paths.exists() {
            return Err(Error::VmNotFound(vm_name.to_string()));
        }
        if !process::is_running(pid) {
            return Err(Error::ProcessNotRunning { pid });
        }

        let record = SessionRecord::new(vm_name, pid, ssh_port, uuid, mac_address)
            .with_command_line(command_line);
        self.store.save(&record)?;
        self.cache.lock().insert(vm_name.to_string(), record.clone());

        tracing::info!(vm = vm_name, pid, ssh_port, "session created");
        Ok(record)
    }

    fn get_session_info(&self, vm_name: &str) -> Option<SessionRecord> {
        let cached = self.cache.lock().get(vm_name).cloned();
        if let Some(record) = cached {
            if process::is_running(record.pid) {
                return Some(record);
            }
            tracing::debug!(vm = vm_name, pid = record.pid, "cached session is no longer running");
            self.cleanup_session(vm_name);
            return None;
        }

        let record = self.store.load(vm_name)?;
        if process::is_running(record.pid) {
            self.cache.lock().insert(vm_name.to_string(), record.clone());
            Some(record)
        } else {
            tracing::debug!(vm = vm_name, pid = record.pid, "stored session is no longer running");
            self.cleanup_session(vm_name);
            None
        }
    }

    /// Drop the cache entry and delete artifacts. Returns true if anything
    /// was removed.
    fn cleanup_session(&self, vm_name: &str) -> bool {
        let evicted = self.cache.lock().remove(vm_name).is_some();
        match self.store.delete(vm_name) {
            Ok(removed) => {
                if removed || evicted {
                    tracing::info!(vm = vm_name, "session cleaned up");
                }
                removed || evicted
            }
            Err(e) => {
                self.reporter
                    .report(&e, &[("vm", vm_name), ("operation", "cleanup_session")]);
                evicted
            }
        }
    }

    fn stop_session(&self, vm_name: &str, force: bool) -> bool {
        let Some(mut record) = self.get_session_info(vm_name) else {
            tracing::warn!(vm = vm_name, "no active session to stop");
            // Unreadable leftovers are still removed.
            self.cleanup_session(vm_name);
            return true;
        };
        let pid = record.pid;

        record.status = SessionStatus::Stopping;
        self.cache.lock().insert(vm_name.to_string(), record.clone());
        if let Err(e) = self.store.save(&record) {
            tracing::debug!(vm = vm_name, error = %e, "could not persist stopping status");
        }

        let result = if force {
            tracing::info!(vm = vm_name, pid, "force stopping vm");
            self.kill(pid)
        } else {
            tracing::info!(vm = vm_name, pid, "stopping vm");
            self.terminate(vm_name, pid)
        };

        if let Err(e) = result {
            self.reporter
                .report(&e, &[("vm", vm_name), ("operation", "stop_session")]);
            return false;
        }

        self.cleanup_session(vm_name);
        tracing::info!(vm = vm_name, pid, "vm stopped");
        true
    }

    fn terminate(&self, vm_name: &str, pid: Pid) -> Result<()> {
        if process::send_signal(pid, Signal::Terminate)? == Delivery::Gone {
            return Ok(());
        }

        for _ in 0..self.config.stop_poll_attempts {
            std::thread::sleep(self.config.stop_poll_interval());
            if !process::is_running(pid) {
                return Ok(());
            }
        }

        tracing::warn!(vm = vm_name, pid, "vm did not exit after SIGTERM, sending SIGKILL");
        self.kill(pid)
    }

    fn kill(&self, pid: Pid) -> Result<()> {
        if process::send_signal(pid, Signal::Kill)? == Delivery::Delivered {
            std::thread::sleep(self.config.kill_settle());
        }
        Ok(())
    }

    fn cleanup_stale_sessions(&self) -> usize {
        let mut cleaned = 0;
        for vm in paths::list_vm_names(self.store.vms_dir()) {
            if let Some(reason) = self.stale_reason(&vm) {
                tracing::info!(vm = %vm, reason, "cleaning stale session");
                if self.cleanup_session(&vm) {
                    cleaned += 1;
                }
            }
        }

        cleaned += self.cleanup_orphans();
        if cleaned > 0 {
            tracing::info!(cleaned, "stale session cleanup finished");
        }
        cleaned
    }

    fn stale_reason(&self, vm_name: &str) -> Option<&'static str> {
        if !self.store.has_artifacts(vm_name) {
            // Nothing on disk to clean; drop any leftover cache entry.
            self.cache.lock().remove(vm_name);
            return None;
        }

        let Some(record) = self.store.load(vm_name) else {
            return Some("session data unreadable");
        };

        if !process::is_alive(record.pid) {
            Some("process not alive")
        } else if process::is_zombie(record.pid) {
            Some("process is a zombie")
        } else if record.heartbeat_expired(self.config.heartbeat_timeout()) {
            Some("heartbeat timeout exceeded")
        } else {
            None
        }
    }

    /// Old lock files and corrupt session documents.
    fn cleanup_orphans(&self) -> usize {
        let max_age = self.config.lock_max_age();
        let now = SystemTime::now();
        let mut cleaned = 0;

        for vm in paths::list_vm_names(self.store.vms_dir()) {
            let Ok(vm_paths) = self.store.paths(&vm) else {
                continue;
            };

            for lock in vm_paths.lock_files() {
                let age = std::fs::metadata(&lock)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok());
                if matches!(age, Some(age) if age > max_age) {
                    match paths::remove_if_exists(&lock) {
                        Ok(true) => {
                            tracing::info!(path = %lock.display(), "removed orphaned lock file");
                            cleaned += 1;
                        }
                        Ok(false) => {}
                        Err(e) => tracing::warn!(error = %e, "failed to remove lock file"),
                    }
                }
            }

            let doc = vm_paths.session_data();
            let corrupt = std::fs::read_to_string(&doc)
                .map(|text| serde_json::from_str::<SessionRecord>(&text).is_err())
                .unwrap_or(false);
            if corrupt {
                match paths::remove_if_exists(&doc) {
                    Ok(true) => {
                        tracing::info!(vm = %vm, "removed corrupt session document");
                        cleaned += 1;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(vm = %vm, error = %e, "failed to remove corrupt session document"),
                }
            }
        }
        cleaned
    }

    fn update_session_heartbeat(&self, vm_name: &str) -> bool {
        let Some(pid) = self.cache.lock().get(vm_name).map(|r| r.pid) else {
            return false;
        };
        if !process::is_running(pid) {
            tracing::debug!(vm = vm_name, pid, "heartbeat for a session that is no longer running");
            self.cleanup_session(vm_name);
            return false;
        }

        let record = {
            let mut cache = self.cache.lock();
            let Some(record) = cache.get_mut(vm_name) else {
                return false;
            };
            record.touch();
            if record.status == SessionStatus::Recovered {
                record.status = SessionStatus::Running;
            }
            record.clone()
        };

        match self.store.save(&record) {
            Ok(()) => true,
            Err(e) => {
                self.reporter
                    .report(&e, &[("vm", vm_name), ("operation", "update_heartbeat")]);
                false
            }
        }
    }

    fn validate(&self, vm_name: &str) -> IntegrityReport {
        integrity::audit_session(&self.store, vm_name, &self.config)
    }

    fn recover_session(&self, vm_name: &str) -> bool {
        let report = self.validate(vm_name);
        if report.is_valid {
            tracing::info!(vm = vm_name, "session is valid, nothing to recover");
            return self.get_session_info(vm_name).is_some();
        }

        let Some(pid) = process::find_qemu_process(vm_name) else {
            tracing::info!(vm = vm_name, "no running qemu process found to recover");
            self.cleanup_session(vm_name);
            return false;
        };

        let command_line = process::cmdline(pid);
        let ssh_port = command_line
            .as_deref()
            .and_then(process::parse_ssh_port)
            .unwrap_or(self.config.default_ssh_port);
        let (uuid, mac_address) = self.recovered_identity(vm_name);

        let record = SessionRecord::new(vm_name, pid, ssh_port, uuid, mac_address)
            .with_command_line(command_line)
            .with_status(SessionStatus::Recovered);

        if let Err(e) = self.store.save(&record) {
            self.reporter
                .report(&e, &[("vm", vm_name), ("operation", "recover_session")]);
            return false;
        }
        self.cache.lock().insert(vm_name.to_string(), record);

        tracing::info!(vm = vm_name, pid, ssh_port, "session recovered");
        true
    }

    /// Identity from the VM's identifier bundle, or a placeholder.
    fn recovered_identity(&self, vm_name: &str) -> (String, String) {
        let bundle = self
            .store
            .paths(vm_name)
            .ok()
            .and_then(|p| IdentifierBundle::read_from(&p.identifiers()));

        match bundle {
            Some(bundle) => (bundle.vm_uuid, bundle.mac_address),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                (format!("recovered-{}", &id[..8]), UNKNOWN.to_string())
            }
        }
    }
}
