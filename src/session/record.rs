//! Session record types.

use crate::process::Pid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder for identity fields that could not be determined.
pub const UNKNOWN: &str = "unknown";

/// Lifecycle status stored with a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Launched and tracked normally.
    #[default]
    Running,
    /// Reconstructed from the process table after tracking was lost.
    Recovered,
    /// A stop request is in progress.
    Stopping,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Recovered => write!(f, "recovered"),
            SessionStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Runtime tracking record for one VM process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    /// VM name (directory name within its namespace).
    pub vm_name: String,

    /// QEMU process id.
    pub pid: Pid,

    /// Host port forwarded to guest SSH, 0 if unmanaged.
    #[serde(default)]
    pub ssh_port: u16,

    /// Active VM UUID.
    pub uuid: String,

    /// Active MAC address.
    pub mac_address: String,

    /// When the session was created.
    pub start_time: DateTime<Utc>,

    /// Last time the session was confirmed as actively managed.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Lifecycle status.
    #[serde(default)]
    pub status: SessionStatus,

    /// QEMU version string, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu_version: Option<String>,

    /// Command line used to launch QEMU, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,

    /// Resident memory in MiB at last sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,

    /// CPU percent at last sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f32>,
}

impl SessionRecord {
    /// New running session started now, with a fresh heartbeat.
    pub fn new(
        vm_name: impl Into<String>,
        pid: Pid,
        ssh_port: u16,
        uuid: impl Into<String>,
        mac_address: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            vm_name: vm_name.into(),
            pid,
            ssh_port,
            uuid: uuid.into(),
            mac_address: mac_address.into(),
            start_time: now,
            last_heartbeat: Some(now),
            status: SessionStatus::Running,
            qemu_version: None,
            command_line: None,
            memory_usage: None,
            cpu_usage: None,
        }
    }

    /// Record assembled from legacy pid/port files only.
    ///
    /// Start time is unknown and reported as now; there is no heartbeat.
    pub fn degraded(vm_name: impl Into<String>, pid: Pid, ssh_port: u16) -> Self {
        Self {
            last_heartbeat: None,
            ..Self::new(vm_name, pid, ssh_port, UNKNOWN, UNKNOWN)
        }
    }

    /// Set the launch command line.
    pub fn with_command_line(mut self, command_line: Option<String>) -> Self {
        self.command_line = command_line;
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    /// Time since the last heartbeat, `None` if there never was one.
    pub fn heartbeat_age(&self) -> Option<chrono::Duration> {
        self.last_heartbeat.map(|hb| Utc::now() - hb)
    }

    /// Time since the session started.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }

    /// Whether the heartbeat is older than `timeout`.
    pub fn heartbeat_expired(&self, timeout: std::time::Duration) -> bool {
        match (self.heartbeat_age(), chrono::Duration::from_std(timeout)) {
            (Some(age), Ok(limit)) => age > limit,
            _ => false,
        }
    }

    /// Refresh the heartbeat to now.
    pub fn touch(&mut self) {
        self.last_heartbeat = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_session_has_heartbeat() {
        let s = SessionRecord::new("vm", 10, 2222, "u1", "52:54:00:11:22:33");
        assert_eq!(s.status, SessionStatus::Running);
        assert_eq!(s.last_heartbeat, Some(s.start_time));
        assert!(!s.heartbeat_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_degraded_session_has_unknown_identity() {
        let s = SessionRecord::degraded("vm", 10, 2222);
        assert_eq!(s.uuid, UNKNOWN);
        assert_eq!(s.mac_address, UNKNOWN);
        assert!(s.last_heartbeat.is_none());
        assert!(!s.heartbeat_expired(Duration::from_secs(0)));
    }

    #[test]
    fn test_heartbeat_expiry() {
        let mut s = SessionRecord::new("vm", 10, 0, "u", "m");
        s.last_heartbeat = Some(Utc::now() - chrono::Duration::hours(25));
        assert!(s.heartbeat_expired(Duration::from_secs(24 * 3600)));
        s.touch();
        assert!(!s.heartbeat_expired(Duration::from_secs(24 * 3600)));
    }

    #[test]
    fn test_minimal_document_deserializes() {
        // Documents written before the optional fields existed.
        let json = r#"{
            "vm_name": "old",
            "pid": 4242,
            "ssh_port": 2222,
            "uuid": "abc",
            "mac_address": "52:54:00:aa:bb:cc",
            "start_time": "2024-01-01T00:00:00Z"
        }"#;
        let s: SessionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(s.pid, 4242);
        assert_eq!(s.status, SessionStatus::Running);
        assert!(s.last_heartbeat.is_none());
        assert!(s.command_line.is_none());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let s = SessionRecord::new("vm", 1, 0, "u", "m").with_status(SessionStatus::Recovered);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["status"], "recovered");
    }
}
