//! Read-only session audit.

use super::record::SessionRecord;
use super::store::SessionStore;
use crate::config::SessionConfig;
use crate::process;
use serde::Serialize;

/// Result of auditing one VM's session state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// VM that was audited.
    pub vm_name: String,
    /// True when no issues were found. Warnings do not affect validity.
    pub is_valid: bool,
    /// Problems that make the session unusable.
    pub issues: Vec<String>,
    /// Conditions worth attention that do not invalidate the session.
    pub warnings: Vec<String>,
    /// Suggested next steps.
    pub recommendations: Vec<String>,
}

impl IntegrityReport {
    fn new(vm_name: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            ..Default::default()
        }
    }

    fn finish(mut self) -> Self {
        self.is_valid = self.issues.is_empty();
        if !self.is_valid {
            self.recommendations
                .push("Run session cleanup to fix issues".to_string());
        }
        if !self.warnings.is_empty() {
            self.recommendations
                .push("Consider restarting long-running sessions".to_string());
        }
        self
    }
}

/// Audit the session stored for `vm_name`.
///
/// Only reads the store, so a dead or corrupt session is reported as it is
/// on disk instead of being cleaned up first.
pub fn audit_session(store: &SessionStore, vm_name: &str, config: &SessionConfig) -> IntegrityReport {
    let has_files = store.has_artifacts(vm_name);
    let record = store.load(vm_name);
    audit(vm_name, has_files, record.as_ref(), config)
}

/// Audit a session without touching disk or cache.
///
/// `has_files` is whether any session artifact exists; `record` is whatever
/// the store could load.
pub(crate) fn audit(
    vm_name: &str,
    has_files: bool,
    record: Option<&SessionRecord>,
    config: &SessionConfig,
) -> IntegrityReport {
    let mut report = IntegrityReport::new(vm_name);

    if !has_files {
        report.issues.push("No session files found".to_string());
    }

    let Some(record) = record else {
        report.issues.push("Cannot load session data".to_string());
        return report.finish();
    };

    if !process::is_alive(record.pid) {
        report
            .issues
            .push(format!("Process {} is not running", record.pid));
    } else if process::is_zombie(record.pid) {
        report
            .issues
            .push(format!("Process {} is a zombie", record.pid));
    }

    match record.heartbeat_age() {
        Some(age) => {
            let secs = age.num_seconds().max(0) as u64;
            if secs > config.heartbeat_timeout_secs {
                report.issues.push("Heartbeat timeout exceeded".to_string());
            } else if secs > config.heartbeat_warn_secs {
                report.warnings.push(format!(
                    "Heartbeat is {} old",
                    humantime::format_duration(std::time::Duration::from_secs(secs))
                ));
            }
        }
        None => report
            .warnings
            .push("No heartbeat data available".to_string()),
    }

    let age = record.age().num_seconds().max(0) as u64;
    if age > config.session_age_warn_secs {
        report.warnings.push(format!(
            "Session has been running for {}",
            humantime::format_duration(std::time::Duration::from_secs(age))
        ));
    }

    report.finish()
}
