//! Guest-side identity script.

use super::bundle::IdentifierBundle;
use crate::error::{Error, Result};
use crate::paths::{validate_vm_name, VmPaths};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Script file name inside the VM's shared directory.
pub const GUEST_SCRIPT: &str = "set_identifiers.sh";

fn render(vm_name: &str, bundle: &IdentifierBundle) -> String {
    let machine_id = &bundle.machine_id;
    let hostname = format!("{}-{}", vm_name, bundle.hostname_suffix());

    format!(
        r#"#!/bin/bash
# Apply unique system identifiers inside the guest.
# VM: {vm_name}
# Generated: {created}
set -u

echo "Setting machine-id..."
echo "{machine_id}" | sudo tee /etc/machine-id > /dev/null
echo "{machine_id}" | sudo tee /var/lib/dbus/machine-id > /dev/null

echo "Regenerating SSH host keys..."
sudo rm -f /etc/ssh/ssh_host_*
sudo ssh-keygen -A

NEW_HOSTNAME="{hostname}"
echo "Setting hostname to: $NEW_HOSTNAME"
echo "$NEW_HOSTNAME" | sudo tee /etc/hostname > /dev/null
sudo hostnamectl set-hostname "$NEW_HOSTNAME" 2>/dev/null || true
sudo sed -i "s/127.0.1.1.*/127.0.1.1\t$NEW_HOSTNAME/" /etc/hosts

sudo systemctl restart systemd-journald 2>/dev/null || true
sudo rm -f /var/lib/dhcp/dhclient.leases 2>/dev/null || true
sudo rm -f /var/lib/NetworkManager/*.lease 2>/dev/null || true

if command -v update-grub >/dev/null 2>&1; then
    sudo update-grub 2>/dev/null || true
fi

echo "Machine ID: {machine_id}"
echo "VM UUID: {vm_uuid}"
echo "MAC Address: {mac}"
echo "Reboot the VM for all changes to take effect."
"#,
        vm_name = vm_name,
        created = bundle.created_at.to_rfc3339(),
        machine_id = machine_id,
        hostname = hostname,
        vm_uuid = bundle.vm_uuid,
        mac = bundle.mac_address,
    )
}

/// Write `shared/set_identifiers.sh` for the VM and make it executable.
pub fn write_guest_script(paths: &VmPaths, vm_name: &str, bundle: &IdentifierBundle) -> Result<PathBuf> {
    validate_vm_name(vm_name)?;
    let shared = paths.shared_dir();
    std::fs::create_dir_all(&shared).map_err(|e| Error::storage(&shared, e))?;

    let script = shared.join(GUEST_SCRIPT);
    std::fs::write(&script, render(vm_name, bundle)).map_err(|e| Error::storage(&script, e))?;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::storage(&script, e))?;

    tracing::debug!(vm = vm_name, path = %script.display(), "wrote guest identity script");
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_contents_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(dir.path(), "web").unwrap();
        let bundle = IdentifierBundle::generate();

        let script = write_guest_script(&paths, "web", &bundle).unwrap();
        assert_eq!(script, paths.shared_dir().join(GUEST_SCRIPT));

        let text = std::fs::read_to_string(&script).unwrap();
        assert!(text.starts_with("#!/bin/bash"));
        assert!(text.contains(&format!("echo \"{}\" | sudo tee /etc/machine-id", bundle.machine_id)));
        assert!(text.contains(&format!("NEW_HOSTNAME=\"web-{}\"", &bundle.machine_id[..8])));

        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_shell_metacharacters_in_name_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(dir.path(), "web").unwrap();
        let bundle = IdentifierBundle::generate();

        for name in ["web$(touch PWNED)", "web`id`", "web\"; rm -rf /; \""] {
            let err = write_guest_script(&paths, name, &bundle).unwrap_err();
            assert!(matches!(err, Error::InvalidVmName { .. }), "{:?}", name);
        }
        assert!(!paths.shared_dir().join(GUEST_SCRIPT).exists());
    }
}
