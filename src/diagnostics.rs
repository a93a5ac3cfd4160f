//! Error classification and recovery reporting.
//!
//! Every [`Error`] can be turned into an [`ErrorReport`]: a stable code, a
//! category, a severity and a list of actionable suggestions. The CLI renders
//! reports; library code only produces and logs them through an
//! [`ErrorReporter`].

use crate::error::Error;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::Arc;

/// Maximum number of reports kept in the reporter history.
pub const MAX_HISTORY: usize = 100;

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Permission denied on a file, device or signal.
    Permission,
    /// Bad or unreadable configuration.
    Configuration,
    /// A file, directory or VM is missing.
    Resource,
    /// Host hardware problem.
    Hardware,
    /// Networking problem.
    Network,
    /// IO failure while reading or writing state.
    Storage,
    /// Signal or process lifecycle failure.
    Process,
    /// Malformed input.
    Validation,
    /// Missing external tool or file shipped by another package.
    Dependency,
    /// System-level failure.
    System,
    /// Bug in qvm itself.
    Internal,
    /// Anything not classified above.
    Unknown,
}

impl ErrorCategory {
    /// Base number of the category's code range.
    pub fn code_base(self) -> u16 {
        match self {
            ErrorCategory::Unknown => 0,
            ErrorCategory::Permission => 100,
            ErrorCategory::Configuration => 200,
            ErrorCategory::Resource => 300,
            ErrorCategory::Hardware => 400,
            ErrorCategory::Network => 500,
            ErrorCategory::Storage => 600,
            ErrorCategory::Process => 700,
            ErrorCategory::Validation => 800,
            ErrorCategory::Dependency => 900,
            ErrorCategory::System => 1000,
            ErrorCategory::Internal => 1100,
        }
    }

    /// Build the stable code for an offset within this category.
    pub fn code(self, offset: u16) -> String {
        format!("QVM-E{}", self.code_base() + offset)
    }

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCategory::Permission => "permission",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Hardware => "hardware",
            ErrorCategory::Network => "network",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Process => "process",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::System => "system",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How bad a failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Operation continued.
    Warning,
    /// Operation failed.
    Error,
    /// Host or data integrity is at risk.
    Critical,
}

/// A classified failure ready to be shown to a user.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Stable code, e.g. `QVM-E610`.
    pub code: String,
    /// Failure category.
    pub category: ErrorCategory,
    /// Severity.
    pub severity: Severity,
    /// One-line message.
    pub message: String,
    /// Extra detail (usually the underlying OS error).
    pub details: Option<String>,
    /// Actionable suggestions.
    pub suggestions: Vec<String>,
    /// Things the user can do to recover.
    pub recovery_options: Vec<String>,
    /// Free-form context such as the VM name or operation.
    pub context: BTreeMap<String, String>,
    /// Outcome of the registered recovery handler, `None` if there was none.
    pub recovered: Option<bool>,
}

impl ErrorReport {
    fn new(category: ErrorCategory, offset: u16, message: impl Into<String>) -> Self {
        Self {
            code: category.code(offset),
            category,
            severity: Severity::Error,
            message: message.into(),
            details: None,
            suggestions: Vec::new(),
            recovery_options: Vec::new(),
            context: BTreeMap::new(),
            recovered: None,
        }
    }

    fn suggest(mut self, items: &[&str]) -> Self {
        self.suggestions
            .extend(items.iter().map(|s| (*s).to_string()));
        self
    }

    fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn recover(mut self, items: &[&str]) -> Self {
        self.recovery_options
            .extend(items.iter().map(|s| (*s).to_string()));
        self
    }

    fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Classify an error into a report.
pub fn classify(err: &Error) -> ErrorReport {
    match err {
        Error::VmNotFound(name) => ErrorReport::new(
            ErrorCategory::Resource,
            1,
            format!("VM '{}' does not exist", name),
        )
        .suggest(&[
            "Check the VM name for typos",
            "List available VMs in this namespace",
        ])
        .recover(&["Create the VM directory, then retry"]),

        Error::InvalidVmName { name, reason } => ErrorReport::new(
            ErrorCategory::Validation,
            1,
            format!("Invalid VM name '{}'", name),
        )
        .details(reason.clone())
        .suggest(&["Use only letters, digits, '.', '_' and '-'"]),

        Error::ProcessNotRunning { pid } => ErrorReport::new(
            ErrorCategory::Process,
            1,
            format!("Process {} is not running", pid),
        )
        .suggest(&[
            "The QEMU process may have exited during startup",
            "Check the VM console log for errors",
        ])
        .recover(&[
            "Run `qvm session recover <vm>` if the VM is still running",
            "Run `qvm session cleanup` to drop the stale session",
        ]),

        Error::Signal { pid, signal, source } => {
            let category = if source.kind() == ErrorKind::PermissionDenied {
                ErrorCategory::Permission
            } else {
                ErrorCategory::Process
            };
            ErrorReport::new(
                category,
                2,
                format!("Could not send signal {} to process {}", signal, pid),
            )
            .details(source.to_string())
            .suggest(&[
                "Verify the process belongs to the current user",
                "Try again with elevated privileges",
            ])
            .recover(&["Retry with `qvm session stop --force`"])
        }

        Error::StopFailed { vm, reason } => ErrorReport::new(
            ErrorCategory::Process,
            3,
            format!("Failed to stop VM '{}'", vm),
        )
        .details(reason.clone())
        .with_context("vm", vm)
        .suggest(&["Check that the QEMU process belongs to the current user"])
        .recover(&[
            "Retry with `qvm session stop --force`",
            "Run `qvm session validate <vm>` to inspect the session",
        ]),

        Error::SessionWrite { vm, source, .. } => {
            let report = classify_io(source.kind(), 10)
                .details(source.to_string())
                .with_context("vm", vm);
            ErrorReport {
                message: format!("Failed to create session for VM '{}'", vm),
                ..report
            }
            .suggest(&[
                "Check disk space and permissions",
                "Verify the VM directory exists and is writable",
                "Check for file system errors",
            ])
            .recover(&["Run `qvm session cleanup`, then start the VM again"])
        }

        Error::Storage { path, source } => ErrorReport {
            message: format!("Filesystem operation failed on {}", path.display()),
            ..classify_io(source.kind(), 3).details(source.to_string())
        }
        .suggest(&["Check disk space and permissions"]),

        Error::Serialization(e) => ErrorReport::new(
            ErrorCategory::Validation,
            4,
            "Malformed state document",
        )
        .details(e.to_string())
        .suggest(&["Remove the corrupt file and let it be regenerated"])
        .recover(&["Run `qvm session cleanup` to remove corrupt session documents"]),

        Error::FirmwareTemplateMissing { .. } => ErrorReport::new(
            ErrorCategory::Dependency,
            1,
            "Could not find a UEFI variable template",
        )
        .details(err.to_string())
        .suggest(&[
            "Install the OVMF / edk2 firmware package",
            "Add the template path to [firmware].vars_templates",
        ])
        .recover(&[
            "Run `qvm ident nuke`; identifiers are regenerated without a firmware reset",
            "Run `qvm ident regen-disk` to refresh only disk identifiers",
        ]),

        Error::Config(msg) | Error::ConfigLoad(msg) | Error::ConfigSave(msg) => {
            ErrorReport::new(ErrorCategory::Configuration, 1, "Configuration problem")
                .details(msg.clone())
                .suggest(&["Check the qvm config file syntax"])
        }

        Error::Io(source) => ErrorReport {
            message: "IO operation failed".to_string(),
            ..classify_io(source.kind(), 3).details(source.to_string())
        },
    }
}

fn classify_io(kind: ErrorKind, offset: u16) -> ErrorReport {
    match kind {
        ErrorKind::PermissionDenied => {
            ErrorReport::new(ErrorCategory::Permission, 1, "Permission denied").suggest(&[
                "Check file and directory permissions",
                "Try running the command with elevated privileges",
            ])
        }
        ErrorKind::NotFound => {
            ErrorReport::new(ErrorCategory::Resource, 1, "File or resource not found")
                .suggest(&["Verify the path is correct"])
        }
        ErrorKind::InvalidData | ErrorKind::InvalidInput => {
            ErrorReport::new(ErrorCategory::Validation, 1, "Invalid data")
        }
        ErrorKind::TimedOut => {
            ErrorReport::new(ErrorCategory::System, 1, "Operation timed out")
        }
        _ => ErrorReport::new(ErrorCategory::Storage, offset, "IO error"),
    }
}

/// Recovery callback run for a specific error code.
pub type RecoveryHandler = Arc<dyn Fn(&ErrorReport) -> bool + Send + Sync>;

/// Logs classified errors, keeps a bounded history, and dispatches recovery
/// handlers.
pub struct ErrorReporter {
    history: Mutex<VecDeque<ErrorReport>>,
    handlers: Mutex<HashMap<String, RecoveryHandler>>,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a recovery handler for an error code.
    pub fn register_recovery_handler(
        &self,
        code: impl Into<String>,
        handler: impl Fn(&ErrorReport) -> bool + Send + Sync + 'static,
    ) {
        let code = code.into();
        tracing::debug!(code = %code, "registered recovery handler");
        self.handlers.lock().insert(code, Arc::new(handler));
    }

    /// Classify, log and record an error, running the recovery handler
    /// registered for its code. Returns the report with `recovered` set.
    pub fn report(&self, err: &Error, context: &[(&str, &str)]) -> ErrorReport {
        let mut report = classify(err);
        for (k, v) in context {
            report.context.insert((*k).to_string(), (*v).to_string());
        }
        report.recovered = self.attempt_recovery(&report);
        self.record(report.clone());
        report
    }

    /// Log and record an already-built report.
    pub fn record(&self, report: ErrorReport) {
        match report.severity {
            Severity::Critical | Severity::Error => tracing::error!(
                code = %report.code,
                category = %report.category,
                details = report.details.as_deref().unwrap_or(""),
                "{}",
                report.message
            ),
            Severity::Warning => {
                tracing::warn!(code = %report.code, "{}", report.message)
            }
            Severity::Info => tracing::info!(code = %report.code, "{}", report.message),
        }

        let mut history = self.history.lock();
        if history.len() >= MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(report);
    }

    /// Run the recovery handler registered for the report's code.
    ///
    /// Returns `None` when no handler is registered, otherwise whether the
    /// handler succeeded. The handler runs without the registry lock held.
    pub fn attempt_recovery(&self, report: &ErrorReport) -> Option<bool> {
        let handler = self.handlers.lock().get(&report.code).cloned()?;
        tracing::info!(code = %report.code, "attempting recovery");
        let recovered = handler(report);
        if recovered {
            tracing::info!(code = %report.code, "recovery succeeded");
        } else {
            tracing::warn!(code = %report.code, "recovery failed");
        }
        Some(recovered)
    }

    /// Most recent reports, oldest first. `None` returns the whole history.
    pub fn recent(&self, limit: Option<usize>) -> Vec<ErrorReport> {
        let history = self.history.lock();
        let skip = limit.map_or(0, |l| history.len().saturating_sub(l));
        history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_session_write_codes_follow_io_kind() {
        let cases = [
            (io::ErrorKind::Other, "QVM-E610", ErrorCategory::Storage),
            (io::ErrorKind::PermissionDenied, "QVM-E101", ErrorCategory::Permission),
            (io::ErrorKind::NotFound, "QVM-E301", ErrorCategory::Resource),
        ];
        for (kind, code, category) in cases {
            let err = Error::session_write("vm1", "/x/session.json", io::Error::new(kind, "boom"));
            let report = classify(&err);
            assert_eq!(report.code, code, "{:?}", kind);
            assert_eq!(report.category, category);
            assert!(report
                .suggestions
                .iter()
                .any(|s| s.contains("disk space")));
            assert_eq!(report.context.get("vm").map(String::as_str), Some("vm1"));
        }
    }

    #[test]
    fn test_every_report_has_suggestions_or_details() {
        let errors = vec![
            Error::VmNotFound("a".into()),
            Error::invalid_vm_name("../a", "contains a path separator"),
            Error::ProcessNotRunning { pid: 1 },
            Error::FirmwareTemplateMissing { searched: vec![] },
            Error::config("bad"),
        ];
        for err in errors {
            let report = classify(&err);
            assert!(report.code.starts_with("QVM-E"));
            assert!(!report.suggestions.is_empty() || report.details.is_some());
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let reporter = ErrorReporter::new();
        for i in 0..(MAX_HISTORY + 5) {
            reporter.report(&Error::ProcessNotRunning { pid: i as i32 }, &[]);
        }
        let all = reporter.recent(None);
        assert_eq!(all.len(), MAX_HISTORY);
        assert!(all[0].message.contains("Process 5 "));

        let last_two = reporter.recent(Some(2));
        assert_eq!(last_two.len(), 2);
        assert!(last_two[1].message.contains(&format!("{}", MAX_HISTORY + 4)));
    }

    #[test]
    fn test_recovery_handler_dispatch() {
        let reporter = ErrorReporter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        reporter.register_recovery_handler("QVM-E701", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        });

        let report = reporter.report(&Error::ProcessNotRunning { pid: 7 }, &[("vm", "a")]);
        assert_eq!(report.context.get("vm").map(String::as_str), Some("a"));
        assert_eq!(report.recovered, Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.recent(Some(1))[0].recovered, Some(true));

        let other = reporter.report(&Error::VmNotFound("x".into()), &[]);
        assert_eq!(other.recovered, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handler_is_reported() {
        let reporter = ErrorReporter::new();
        reporter.register_recovery_handler("QVM-E301", |_| false);
        let report = reporter.report(&Error::VmNotFound("x".into()), &[]);
        assert_eq!(report.recovered, Some(false));
    }

    #[test]
    fn test_handler_may_report_without_deadlock() {
        let reporter = Arc::new(ErrorReporter::new());
        let inner = Arc::downgrade(&reporter);
        reporter.register_recovery_handler("QVM-E701", move |_| {
            if let Some(reporter) = inner.upgrade() {
                reporter.report(&Error::VmNotFound("nested".into()), &[]);
            }
            true
        });

        let report = reporter.report(&Error::ProcessNotRunning { pid: 3 }, &[]);
        assert_eq!(report.recovered, Some(true));
        assert_eq!(reporter.recent(None).len(), 2);
    }

    #[test]
    fn test_recovery_options_point_at_commands() {
        let report = classify(&Error::ProcessNotRunning { pid: 1 });
        assert!(report
            .recovery_options
            .iter()
            .any(|o| o.contains("qvm session recover")));

        let report = classify(&Error::FirmwareTemplateMissing { searched: vec![] });
        assert!(report
            .recovery_options
            .iter()
            .any(|o| o.contains("qvm ident nuke")));

        let report = classify(&Error::StopFailed {
            vm: "a".into(),
            reason: "denied".into(),
        });
        assert_eq!(report.code, "QVM-E703");
        assert_eq!(report.details.as_deref(), Some("denied"));
        assert!(report.recovery_options.iter().any(|o| o.contains("--force")));
    }
}
