//! Session commands.

use super::{print_json, truncate, Context};
use clap::{Args, Subcommand};
use qvm::session::{audit_session, select_backend, IntegrityReport, SessionManager, SessionStore};

/// Inspect and manage VM sessions
#[derive(Subcommand, Debug)]
pub enum SessionCmd {
    /// List running sessions
    #[command(alias = "ls")]
    List,
    /// Show session details and resource usage
    Info(VmArg),
    /// Stop a running VM
    Stop(StopArgs),
    /// Remove stale sessions and orphaned lock files
    Cleanup,
    /// Audit a session without changing it
    Validate(VmArg),
    /// Rebuild tracking for a running but untracked VM
    Recover(VmArg),
    /// Refresh a session's heartbeat
    Heartbeat(VmArg),
}

/// A VM name argument.
#[derive(Args, Debug)]
pub struct VmArg {
    /// VM name.
    pub name: String,
}

/// Arguments for `session stop`.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// VM name to stop.
    pub name: String,

    /// Kill immediately instead of waiting for a graceful exit.
    #[arg(short, long)]
    pub force: bool,
}

impl SessionCmd {
    /// Execute the session command.
    pub fn run(self, ctx: &Context) -> qvm::Result<()> {
        match self {
            // Store-only: building a manager would clean dead sessions first.
            SessionCmd::Validate(arg) => print_report(&validate(ctx, &arg.name), ctx.json),
            cmd => {
                let manager = SessionManager::for_class(&ctx.config, ctx.class);
                cmd.run_with(&manager, ctx)
            }
        }
    }

    fn run_with(self, manager: &SessionManager, ctx: &Context) -> qvm::Result<()> {
        match self {
            SessionCmd::List => list(manager, ctx.json),
            SessionCmd::Info(arg) => info(manager, &arg.name, ctx.json),
            SessionCmd::Stop(args) => {
                stop(manager, &args.name, args.force)?;
                if ctx.json {
                    print_json(&serde_json::json!({ "vm": args.name, "stopped": true }))
                } else {
                    println!("Stopped VM: {}", args.name);
                    Ok(())
                }
            }
            SessionCmd::Cleanup => {
                let cleaned = manager.cleanup_stale_sessions();
                if ctx.json {
                    print_json(&serde_json::json!({ "cleaned": cleaned }))
                } else {
                    println!("Cleaned up {} stale item(s)", cleaned);
                    Ok(())
                }
            }
            SessionCmd::Validate(arg) => print_report(&manager.validate_session_integrity(&arg.name), ctx.json),
            SessionCmd::Recover(arg) => {
                let recovered = manager.recover_session(&arg.name);
                if ctx.json {
                    return print_json(&serde_json::json!({ "vm": arg.name, "recovered": recovered }));
                }
                if recovered {
                    println!("Recovered session for VM: {}", arg.name);
                } else {
                    println!("Nothing to recover for VM: {}", arg.name);
                }
                Ok(())
            }
            SessionCmd::Heartbeat(arg) => {
                if manager.update_session_heartbeat(&arg.name) {
                    println!("Heartbeat updated for VM: {}", arg.name);
                    Ok(())
                } else {
                    Err(qvm::Error::VmNotFound(arg.name))
                }
            }
        }
    }
}

/// Read-only audit of one VM's stored session.
fn validate(ctx: &Context, name: &str) -> IntegrityReport {
    let vms_dir = ctx.config.vms_dir(ctx.class);
    let backend = select_backend(ctx.config.session.backend, &vms_dir);
    let store = SessionStore::new(vms_dir, backend);
    audit_session(&store, name, &ctx.config.session)
}

fn print_report(report: &IntegrityReport, json: bool) -> qvm::Result<()> {
    if json {
        return print_json(report);
    }
    let verdict = if report.is_valid { "valid" } else { "INVALID" };
    println!("Session {}: {}", report.vm_name, verdict);
    for issue in &report.issues {
        println!("  issue:   {}", issue);
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    for rec in &report.recommendations {
        println!("  hint:    {}", rec);
    }
    Ok(())
}

/// Stop a VM, turning a failed stop into an error carrying the last
/// classified failure.
fn stop(manager: &SessionManager, name: &str, force: bool) -> qvm::Result<()> {
    if manager.stop_session(name, force) {
        return Ok(());
    }
    let reason = manager
        .recent_errors(Some(1))
        .pop()
        .map(|report| report.to_string())
        .unwrap_or_else(|| "the process could not be signalled".to_string());
    Err(qvm::Error::StopFailed {
        vm: name.to_string(),
        reason,
    })
}

fn list(manager: &SessionManager, json: bool) -> qvm::Result<()> {
    let sessions = manager.list_sessions();
    if json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No running sessions");
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<6} {:<10} {:<18} {:<20}",
        "NAME", "PID", "SSH", "STATUS", "MAC", "STARTED"
    );
    println!("{}", "-".repeat(86));
    for (name, s) in &sessions {
        println!(
            "{:<20} {:<8} {:<6} {:<10} {:<18} {:<20}",
            truncate(name, 18),
            s.pid,
            s.ssh_port,
            s.status,
            s.mac_address,
            s.start_time.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn info(manager: &SessionManager, name: &str, json: bool) -> qvm::Result<()> {
    let stats = manager
        .get_session_stats(name)
        .ok_or_else(|| qvm::Error::VmNotFound(name.to_string()))?;
    if json {
        return print_json(&stats);
    }

    println!("VM:       {}", stats.vm_name);
    println!("Status:   {}", stats.status);
    println!("PID:      {}", stats.pid);
    println!("SSH port: {}", stats.ssh_port);
    println!("UUID:     {}", stats.uuid);
    println!("MAC:      {}", stats.mac_address);
    println!("Uptime:   {}", stats.uptime);
    if let Some(cpu) = stats.cpu_percent {
        println!("CPU:      {:.1}%", cpu);
    }
    if let Some(mem) = stats.memory_mb {
        println!("Memory:   {} MiB", mem);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qvm::config::QvmConfig;
    use qvm::paths::{VmClass, VmPaths};
    use qvm::session::{SessionBackend, SessionRecord, StructuredBackend};

    fn context(root: &std::path::Path) -> Context {
        let mut config = QvmConfig::with_root(root);
        config.session.background_sweep = false;
        Context {
            config,
            class: VmClass::Linux,
            json: false,
        }
    }

    #[test]
    fn test_validate_keeps_dead_session_files() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let vms_dir = ctx.config.vms_dir(VmClass::Linux);
        std::fs::create_dir_all(vms_dir.join("vm")).unwrap();
        let paths = VmPaths::new(&vms_dir, "vm").unwrap();
        StructuredBackend
            .save(&paths, &SessionRecord::new("vm", 0, 2222, "u", "m"))
            .unwrap();

        let report = validate(&ctx, "vm");
        assert_eq!(report.issues, vec!["Process 0 is not running"]);
        assert!(paths.session_data().exists());

        SessionCmd::Validate(VmArg { name: "vm".into() }).run(&ctx).unwrap();
        assert!(paths.session_data().exists());
    }

    #[test]
    fn test_stop_without_session_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let manager = SessionManager::for_class(&ctx.config, ctx.class);
        assert!(stop(&manager, "absent", false).is_ok());
    }
}
