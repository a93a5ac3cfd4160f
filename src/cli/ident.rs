//! Identity commands.

use super::{print_json, Context};
use clap::{Args, Subcommand};
use qvm::identity::{IdentifierBundle, IdentityManager};

/// Manage per-VM unique identifiers
#[derive(Subcommand, Debug)]
pub enum IdentCmd {
    /// Show identifiers for one VM or all VMs
    Show(ShowArgs),
    /// Create identifiers if the VM has none
    Ensure(NameArg),
    /// Give the VM new disk, partition and filesystem UUIDs
    RegenDisk(NameArg),
    /// Regenerate every identifier and reset UEFI variables
    Nuke(NameArg),
}

/// Arguments for `ident show`.
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// VM name (all VMs if omitted).
    pub name: Option<String>,
}

/// A VM name argument.
#[derive(Args, Debug)]
pub struct NameArg {
    /// VM name.
    pub name: String,
}

impl IdentCmd {
    /// Execute the identity command.
    pub fn run(self, ctx: &Context) -> qvm::Result<()> {
        let ids = IdentityManager::for_class(&ctx.config, ctx.class);
        match self {
            IdentCmd::Show(args) => {
                let bundles = ids.list(args.name.as_deref());
                if let (Some(name), true) = (&args.name, bundles.is_empty()) {
                    return Err(qvm::Error::VmNotFound(name.clone()));
                }
                if ctx.json {
                    return print_json(&bundles);
                }
                for (name, bundle) in &bundles {
                    print_bundle(name, bundle);
                }
                Ok(())
            }
            IdentCmd::Ensure(arg) => {
                require_vm_dir(&ids, &arg.name)?;
                let bundle = ids.get_or_create(&arg.name, false)?;
                output(ctx, &arg.name, &bundle)
            }
            IdentCmd::RegenDisk(arg) => {
                require_vm_dir(&ids, &arg.name)?;
                let bundle = ids.regenerate_disk_identifiers(&arg.name)?;
                output(ctx, &arg.name, &bundle)
            }
            IdentCmd::Nuke(arg) => {
                require_vm_dir(&ids, &arg.name)?;
                let bundle = ids.nuke_and_regenerate_all(&arg.name)?;
                if !ctx.json {
                    println!("Regenerated all identifiers for VM: {}", arg.name);
                }
                output(ctx, &arg.name, &bundle)
            }
        }
    }
}

fn require_vm_dir(ids: &IdentityManager, name: &str) -> qvm::Result<()> {
    if ids.paths(name)?.exists() {
        Ok(())
    } else {
        Err(qvm::Error::VmNotFound(name.to_string()))
    }
}

fn output(ctx: &Context, name: &str, bundle: &IdentifierBundle) -> qvm::Result<()> {
    if ctx.json {
        print_json(bundle)
    } else {
        print_bundle(name, bundle);
        Ok(())
    }
}

fn print_bundle(name: &str, b: &IdentifierBundle) {
    println!("{}:", name);
    println!("  vm_uuid:            {}", b.vm_uuid);
    println!("  machine_id:         {}", b.machine_id);
    println!("  mac_address:        {}", b.mac_address);
    println!("  disk_uuid:          {}", b.disk_uuid);
    println!("  partition_uuid:     {}", b.partition_uuid);
    println!("  filesystem_uuid:    {}", b.filesystem_uuid);
    println!("  boot_uuid:          {}", b.boot_uuid);
    println!("  swap_uuid:          {}", b.swap_uuid);
    println!("  dmi_uuid:           {}", b.dmi_uuid);
    println!("  smbios_uuid:        {}", b.smbios_uuid);
    println!("  bios_uuid:          {}", b.bios_uuid);
    println!("  cpu_serial:         {}", b.cpu_serial);
    println!("  motherboard_serial: {}", b.motherboard_serial);
    println!("  created_at:         {}", b.created_at.to_rfc3339());
}
