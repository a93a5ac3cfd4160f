//! Identifier bundle generation.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Locally administered prefix QEMU uses for guest NICs.
pub const MAC_PREFIX: &str = "52:54:00";

/// Every identifier a guest can observe, for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierBundle {
    /// VM (hypervisor) UUID.
    pub vm_uuid: String,
    /// systemd machine-id (32 lowercase hex characters).
    pub machine_id: String,
    /// NIC MAC address with the QEMU prefix.
    pub mac_address: String,
    /// Disk image UUID.
    pub disk_uuid: String,
    /// Root partition UUID.
    pub partition_uuid: String,
    /// Root filesystem UUID.
    pub filesystem_uuid: String,
    /// Boot partition UUID.
    pub boot_uuid: String,
    /// Swap UUID.
    pub swap_uuid: String,
    /// DMI UUID.
    pub dmi_uuid: String,
    /// SMBIOS system UUID.
    pub smbios_uuid: String,
    /// CPU serial number.
    pub cpu_serial: String,
    /// Motherboard serial number.
    pub motherboard_serial: String,
    /// BIOS UUID.
    pub bios_uuid: String,
    /// When the bundle was first generated.
    pub created_at: DateTime<Utc>,
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// MAC address with [`MAC_PREFIX`] and three random octets.
pub fn random_mac() -> String {
    format!(
        "{}:{:02x}:{:02x}:{:02x}",
        MAC_PREFIX,
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>()
    )
}

fn random_serial(prefix: &str) -> String {
    let mut rng = rand::rng();
    format!(
        "{}{}{}",
        prefix,
        rng.random_range(100_000..=999_999u32),
        rng.random_range(1_000..=9_999u32)
    )
}

/// Random CPU serial, e.g. `CPU4821937712`.
pub fn random_cpu_serial() -> String {
    random_serial("CPU")
}

/// Random motherboard serial, e.g. `MB4821937712`.
pub fn random_motherboard_serial() -> String {
    random_serial("MB")
}

impl IdentifierBundle {
    /// Generate a bundle of independent random identifiers.
    pub fn generate() -> Self {
        Self {
            vm_uuid: new_uuid(),
            machine_id: Uuid::new_v4().simple().to_string(),
            mac_address: random_mac(),
            disk_uuid: new_uuid(),
            partition_uuid: new_uuid(),
            filesystem_uuid: new_uuid(),
            boot_uuid: new_uuid(),
            swap_uuid: new_uuid(),
            dmi_uuid: new_uuid(),
            smbios_uuid: new_uuid(),
            cpu_serial: random_cpu_serial(),
            motherboard_serial: random_motherboard_serial(),
            bios_uuid: new_uuid(),
            created_at: Utc::now(),
        }
    }

    /// Replace the disk-level identifiers, leaving everything else intact.
    pub fn regenerate_disk(&mut self) {
        self.disk_uuid = new_uuid();
        self.partition_uuid = new_uuid();
        self.filesystem_uuid = new_uuid();
        self.boot_uuid = new_uuid();
        self.swap_uuid = new_uuid();
    }

    /// Short host-name suffix derived from the machine id.
    pub fn hostname_suffix(&self) -> &str {
        self.machine_id.get(..8).unwrap_or(&self.machine_id)
    }

    /// Load a bundle from a JSON document.
    ///
    /// Missing and corrupt documents both yield `None`; corruption is logged.
    pub fn read_from(path: &Path) -> Option<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable identifier bundle");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt identifier bundle");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn uuid_fields(b: &IdentifierBundle) -> [&str; 10] {
        [
            b.vm_uuid.as_str(),
            b.disk_uuid.as_str(),
            b.partition_uuid.as_str(),
            b.filesystem_uuid.as_str(),
            b.boot_uuid.as_str(),
            b.swap_uuid.as_str(),
            b.dmi_uuid.as_str(),
            b.smbios_uuid.as_str(),
            b.bios_uuid.as_str(),
            b.machine_id.as_str(),
        ]
    }

    #[test]
    fn test_formats() {
        let b = IdentifierBundle::generate();
        assert_eq!(b.machine_id.len(), 32);
        assert!(b.machine_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(b.mac_address.starts_with("52:54:00:"));
        assert_eq!(b.mac_address.len(), 17);
        assert!(b.cpu_serial.starts_with("CPU"));
        assert_eq!(b.cpu_serial.len(), 3 + 10);
        assert!(b.motherboard_serial.starts_with("MB"));
        assert_eq!(b.motherboard_serial.len(), 2 + 10);
        assert!(Uuid::parse_str(&b.vm_uuid).is_ok());
        assert_eq!(b.hostname_suffix(), &b.machine_id[..8]);
    }

    #[test]
    fn test_fields_within_bundle_are_independent() {
        let b = IdentifierBundle::generate();
        let fields: HashSet<&str> = uuid_fields(&b).into_iter().collect();
        assert_eq!(fields.len(), 10);
    }

    #[test]
    fn test_many_bundles_are_pairwise_distinct() {
        let bundles: Vec<IdentifierBundle> = (0..200).map(|_| IdentifierBundle::generate()).collect();
        for i in 0..10 {
            let values: HashSet<&str> = bundles.iter().map(|b| uuid_fields(b)[i]).collect();
            assert_eq!(values.len(), bundles.len(), "field {} collided", i);
        }
    }

    #[test]
    fn test_regenerate_disk_touches_only_disk_fields() {
        let before = IdentifierBundle::generate();
        let mut after = before.clone();
        after.regenerate_disk();

        assert_ne!(after.disk_uuid, before.disk_uuid);
        assert_ne!(after.partition_uuid, before.partition_uuid);
        assert_ne!(after.filesystem_uuid, before.filesystem_uuid);
        assert_ne!(after.boot_uuid, before.boot_uuid);
        assert_ne!(after.swap_uuid, before.swap_uuid);

        let mut restored = after.clone();
        restored.disk_uuid = before.disk_uuid.clone();
        restored.partition_uuid = before.partition_uuid.clone();
        restored.filesystem_uuid = before.filesystem_uuid.clone();
        restored.boot_uuid = before.boot_uuid.clone();
        restored.swap_uuid = before.swap_uuid.clone();
        assert_eq!(restored, before);
    }

    #[test]
    fn test_read_from_missing_or_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identifiers.json");
        assert!(IdentifierBundle::read_from(&path).is_none());
        std::fs::write(&path, "{").unwrap();
        assert!(IdentifierBundle::read_from(&path).is_none());
    }
}
