//! Hardware descriptor arguments for QEMU.
//!
//! Maps an [`IdentifierBundle`] onto `-uuid`, `-smbios` and `-machine`
//! arguments. Building the rest of the command line is not done here.

use super::bundle::IdentifierBundle;

const MACHINE_FLAGS: [&str; 2] = ["accel=kvm", "dump-guest-core=off"];
const DEFAULT_MACHINE: &str = "pc";

/// SMBIOS arguments for the bundle.
fn smbios_args(bundle: &IdentifierBundle) -> Vec<String> {
    vec![
        "-smbios".to_string(),
        format!(
            "type=1,manufacturer=QEMU,product=Standard PC,serial={},uuid={}",
            bundle.motherboard_serial, bundle.smbios_uuid
        ),
        "-smbios".to_string(),
        format!(
            "type=2,manufacturer=QEMU,product=Standard PC,serial={}",
            bundle.motherboard_serial
        ),
        "-smbios".to_string(),
        format!("type=3,manufacturer=QEMU,serial={}", bundle.cpu_serial),
    ]
}

/// Arguments to append to a command line that has no `-uuid`/`-machine`.
pub fn launch_args(bundle: &IdentifierBundle) -> Vec<String> {
    let mut args = vec!["-uuid".to_string(), bundle.vm_uuid.clone()];
    args.extend(smbios_args(bundle));
    args.push("-machine".to_string());
    args.push(format!("{},{}", DEFAULT_MACHINE, MACHINE_FLAGS.join(",")));
    args
}

/// Apply the bundle to an existing argument list.
///
/// An existing `-uuid` value is replaced. An existing `-machine` value gets
/// the KVM and dump flags added if missing. SMBIOS arguments are appended.
pub fn apply_to_command(args: &[String], bundle: &IdentifierBundle) -> Vec<String> {
    let mut out = args.to_vec();

    match value_index(&out, "-uuid") {
        Some(i) => out[i] = bundle.vm_uuid.clone(),
        None => out.extend(["-uuid".to_string(), bundle.vm_uuid.clone()]),
    }

    out.extend(smbios_args(bundle));

    match value_index(&out, "-machine") {
        Some(i) => {
            let value = &mut out[i];
            for flag in MACHINE_FLAGS {
                if !value.split(',').any(|opt| opt == flag) {
                    value.push(',');
                    value.push_str(flag);
                }
            }
        }
        None => out.extend([
            "-machine".to_string(),
            format!("{},{}", DEFAULT_MACHINE, MACHINE_FLAGS.join(",")),
        ]),
    }

    out
}

/// Index of the value following the first occurrence of `flag`.
fn value_index(args: &[String], flag: &str) -> Option<usize> {
    let pos = args.iter().position(|a| a == flag)?;
    (pos + 1 < args.len()).then_some(pos + 1)
}

/// Apply the bundle to a [`std::process::Command`] that has no identity
/// arguments yet.
pub fn extend_command(cmd: &mut std::process::Command, bundle: &IdentifierBundle) {
    cmd.args(launch_args(bundle));
}
