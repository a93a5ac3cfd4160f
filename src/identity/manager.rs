//! Per-VM identifier persistence.

use super::bundle::{
    random_cpu_serial, random_mac, random_motherboard_serial, IdentifierBundle,
};
use super::firmware::reset_firmware_vars;
use super::guest::write_guest_script;
use crate::config::{FirmwareConfig, QvmConfig};
use crate::error::{Error, Result};
use crate::paths::{list_vm_names, VmClass, VmPaths};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Loads, creates and regenerates identifier bundles for VMs in a namespace.
pub struct IdentityManager {
    vms_dir: PathBuf,
    firmware: FirmwareConfig,
}

impl IdentityManager {
    /// Manager over `vms_dir`.
    pub fn new(vms_dir: impl Into<PathBuf>, firmware: FirmwareConfig) -> Self {
        Self {
            vms_dir: vms_dir.into(),
            firmware,
        }
    }

    /// Manager for a VM class using the global configuration.
    pub fn for_class(config: &QvmConfig, class: VmClass) -> Self {
        Self::new(config.vms_dir(class), config.firmware.clone())
    }

    /// Namespace directory.
    pub fn vms_dir(&self) -> &Path {
        &self.vms_dir
    }

    /// Paths for a VM in this namespace.
    pub fn paths(&self, vm_name: &str) -> Result<VmPaths> {
        VmPaths::new(&self.vms_dir, vm_name)
    }

    /// The persisted bundle, if present and readable.
    pub fn get(&self, vm_name: &str) -> Option<IdentifierBundle> {
        let paths = self.paths(vm_name).ok()?;
        IdentifierBundle::read_from(&paths.identifiers())
    }

    /// Bundles for one VM, or for every VM in the namespace.
    pub fn list(&self, vm_name: Option<&str>) -> BTreeMap<String, IdentifierBundle> {
        let names = match vm_name {
            Some(name) => vec![name.to_string()],
            None => list_vm_names(&self.vms_dir),
        };
        names
            .into_iter()
            .filter_map(|vm| self.get(&vm).map(|b| (vm, b)))
            .collect()
    }

    /// Load the VM's bundle, or generate and persist a new one.
    ///
    /// With `force`, or when the stored bundle is unreadable, a fresh bundle
    /// replaces it. Without `force` repeated calls return the same identity.
    pub fn get_or_create(&self, vm_name: &str, force: bool) -> Result<IdentifierBundle> {
        let paths = self.paths(vm_name)?;

        if !force {
            if let Some(existing) = IdentifierBundle::read_from(&paths.identifiers()) {
                tracing::debug!(vm = vm_name, "using existing identifiers");
                return Ok(existing);
            }
        }

        let bundle = self.generate_unique(vm_name);
        self.save(&paths, &bundle)?;
        tracing::info!(vm = vm_name, vm_uuid = %bundle.vm_uuid, mac = %bundle.mac_address, "generated identifiers");
        Ok(bundle)
    }

    /// Give the VM new disk-level identifiers, keeping everything else.
    pub fn regenerate_disk_identifiers(&self, vm_name: &str) -> Result<IdentifierBundle> {
        let paths = self.paths(vm_name)?;
        let mut bundle = self.get_or_create(vm_name, false)?;
        bundle.regenerate_disk();
        self.save(&paths, &bundle)?;

        tracing::info!(vm = vm_name, disk_uuid = %bundle.disk_uuid, "regenerated disk identifiers");
        Ok(bundle)
    }

    /// Regenerate every identifier, reset UEFI variables and rewrite the
    /// guest identity script.
    ///
    /// A missing firmware template is logged and does not fail the nuke.
    pub fn nuke_and_regenerate_all(&self, vm_name: &str) -> Result<IdentifierBundle> {
        let paths = self.paths(vm_name)?;
        tracing::info!(vm = vm_name, "regenerating all identifiers");

        let bundle = self.get_or_create(vm_name, true)?;

        match reset_firmware_vars(&paths, &self.firmware) {
            Ok(_) => {}
            Err(e @ Error::FirmwareTemplateMissing { .. }) => {
                tracing::warn!(vm = vm_name, error = %e, "UEFI variables not reset");
            }
            Err(e) => return Err(e),
        }

        write_guest_script(&paths, vm_name, &bundle)?;
        tracing::info!(vm = vm_name, vm_uuid = %bundle.vm_uuid, "identity nuked and regenerated");
        Ok(bundle)
    }

    /// Reset the VM's UEFI variables without touching identifiers.
    pub fn reset_firmware_vars(&self, vm_name: &str) -> Result<PathBuf> {
        reset_firmware_vars(&self.paths(vm_name)?, &self.firmware)
    }

    /// Write the guest identity script for the VM's current bundle.
    pub fn write_guest_script(&self, vm_name: &str) -> Result<PathBuf> {
        let bundle = self.get_or_create(vm_name, false)?;
        write_guest_script(&self.paths(vm_name)?, vm_name, &bundle)
    }

    /// Generate a bundle whose MAC and serials do not collide with siblings.
    fn generate_unique(&self, vm_name: &str) -> IdentifierBundle {
        let siblings: Vec<IdentifierBundle> = list_vm_names(&self.vms_dir)
            .into_iter()
            .filter(|name| name != vm_name)
            .filter_map(|name| self.get(&name))
            .collect();

        let macs: HashSet<&str> = siblings.iter().map(|b| b.mac_address.as_str()).collect();
        let cpus: HashSet<&str> = siblings.iter().map(|b| b.cpu_serial.as_str()).collect();
        let boards: HashSet<&str> = siblings.iter().map(|b| b.motherboard_serial.as_str()).collect();

        let mut bundle = IdentifierBundle::generate();
        while macs.contains(bundle.mac_address.as_str()) {
            tracing::debug!(vm = vm_name, mac = %bundle.mac_address, "mac collides with sibling, rerolling");
            bundle.mac_address = random_mac();
        }
        while cpus.contains(bundle.cpu_serial.as_str()) {
            bundle.cpu_serial = random_cpu_serial();
        }
        while boards.contains(bundle.motherboard_serial.as_str()) {
            bundle.motherboard_serial = random_motherboard_serial();
        }
        bundle
    }

    fn save(&self, paths: &VmPaths, bundle: &IdentifierBundle) -> Result<()> {
        let dir = paths.dir();
        std::fs::create_dir_all(dir).map_err(|e| Error::storage(dir, e))?;

        let target = paths.identifiers();
        let json = serde_json::to_vec_pretty(bundle)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::storage(&target, e))?;
        tmp.write_all(&json).map_err(|e| Error::storage(&target, e))?;
        tmp.persist(&target)
            .map_err(|e| Error::storage(&target, e.error))?;
        Ok(())
    }
}
