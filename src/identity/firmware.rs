//! UEFI variable store reset.

use crate::config::FirmwareConfig;
use crate::error::{Error, Result};
use crate::paths::{remove_if_exists, VmPaths};
use std::path::PathBuf;

/// Replace the VM's UEFI variables with a clean template.
///
/// Copies the first existing template over `uefi-seed.fd` and removes
/// `uefi-instance.fd` so the next boot starts from the clean seed. Returns the
/// template used.
pub fn reset_firmware_vars(paths: &VmPaths, firmware: &FirmwareConfig) -> Result<PathBuf> {
    let template = firmware
        .find_template()
        .ok_or_else(|| Error::FirmwareTemplateMissing {
            searched: firmware.vars_templates.clone(),
        })?
        .to_path_buf();

    let seed = paths.uefi_seed();
    remove_if_exists(&seed)?;
    std::fs::copy(&template, &seed).map_err(|e| Error::storage(&seed, e))?;
    remove_if_exists(&paths.uefi_instance())?;

    tracing::info!(
        vm_dir = %paths.dir().display(),
        template = %template.display(),
        "reset UEFI variables"
    );
    Ok(template)
}
