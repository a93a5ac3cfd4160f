//! Process liveness checks and process-table helpers.
//!
//! These functions hold no state and may be called from any thread.

use crate::error::{Error, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

/// OS process id.
pub type Pid = i32;

/// Signals the session layer sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite shutdown request (SIGTERM).
    Terminate,
    /// Immediate kill (SIGKILL).
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Result of delivering a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was delivered.
    Delivered,
    /// No such process.
    Gone,
}

/// Check whether a process exists by sending it the null signal.
///
/// `ESRCH` means the process is gone. `EPERM` means the pid exists but belongs
/// to someone else, unless procfs has no entry for it either.
pub fn is_alive(pid: Pid) -> bool {
    // kill(0) and kill(-1) address process groups, never a single process.
    if pid <= 0 {
        return false;
    }

    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }

    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => proc_entry_exists(pid),
        _ => false,
    }
}

#[cfg(target_os = "linux")]
fn proc_entry_exists(pid: Pid) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn proc_entry_exists(_pid: Pid) -> bool {
    true
}

/// Single-letter scheduler state from `/proc/<pid>/stat` (`R`, `S`, `Z`, ...).
pub fn process_state(pid: Pid) -> Option<char> {
    if pid <= 0 {
        return None;
    }
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat_state(&stat)
}

/// The comm field is parenthesised and may itself contain spaces or parens,
/// so the state is the first field after the last `)`.
fn parse_stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

/// Whether the process has exited but not been reaped.
pub fn is_zombie(pid: Pid) -> bool {
    process_state(pid) == Some('Z')
}

/// Alive and not a zombie. This is what "running" means for a session.
pub fn is_running(pid: Pid) -> bool {
    is_alive(pid) && !is_zombie(pid)
}

/// Send a signal. A process that is already gone is not an error.
pub fn send_signal(pid: Pid, signal: Signal) -> Result<Delivery> {
    if pid <= 0 {
        return Ok(Delivery::Gone);
    }

    if unsafe { libc::kill(pid, signal.raw()) } == 0 {
        return Ok(Delivery::Delivered);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(Delivery::Gone)
    } else {
        Err(Error::Signal {
            pid,
            signal: signal.raw(),
            source: err,
        })
    }
}

/// Full command line of a process, arguments joined by spaces.
pub fn cmdline(pid: Pid) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    if raw.is_empty() {
        return None;
    }
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|a| !a.is_empty())
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();
    Some(args.join(" "))
}

/// Matches a QEMU command line naming `vm_name` as a whole word, so `vm1`
/// does not match the command line of `vm10`.
fn qemu_cmdline_pattern(vm_name: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"qemu.*(?:^|[\s,=/]){}(?:[\s,=/]|$)",
        regex::escape(vm_name)
    ))
    .ok()
}

/// Find the lowest running pid whose command line is a QEMU invocation
/// naming `vm_name`.
///
/// The calling process is never returned.
pub fn find_qemu_process(vm_name: &str) -> Option<Pid> {
    let pattern = qemu_cmdline_pattern(vm_name)?;
    let own = std::process::id() as Pid;

    let entries = std::fs::read_dir("/proc").ok()?;
    let mut matches: Vec<Pid> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str()?.parse::<Pid>().ok())
        .filter(|pid| *pid != own)
        .filter(|pid| {
            cmdline(*pid)
                .map(|cmd| pattern.is_match(&cmd))
                .unwrap_or(false)
        })
        .collect();

    matches.sort_unstable();
    let found = matches.into_iter().find(|pid| is_running(*pid));
    if let Some(pid) = found {
        tracing::debug!(vm = vm_name, pid, "found qemu process");
    }
    found
}

fn hostfwd_ssh_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"hostfwd=tcp:[^:,\s]*:(\d+)-[^:,\s]*:22(?:\D|$)").ok())
        .as_ref()
}

/// Extract the host port forwarded to guest port 22 from a QEMU command line.
pub fn parse_ssh_port(cmdline: &str) -> Option<u16> {
    hostfwd_ssh_pattern()?
        .captures(cmdline)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Point-in-time resource usage of a process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    /// CPU usage in percent of one core.
    pub cpu_percent: f32,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// Sample CPU and memory usage. Blocks for one CPU sampling interval.
pub fn usage(pid: Pid) -> Option<ProcessUsage> {
    if pid <= 0 {
        return None;
    }
    let target = [SysPid::from_u32(pid as u32)];
    let mut system = System::new();

    // CPU usage is a delta, so it needs two samples.
    system.refresh_processes(ProcessesToUpdate::Some(&target), true);
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_processes(ProcessesToUpdate::Some(&target), true);

    let process = system.process(target[0])?;
    Some(ProcessUsage {
        cpu_percent: process.cpu_usage(),
        memory_bytes: process.memory(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_own_process_is_running() {
        let pid = std::process::id() as Pid;
        assert!(is_alive(pid));
        assert!(!is_zombie(pid));
        assert!(is_running(pid));
    }

    #[test]
    fn test_non_positive_pids_are_never_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
        assert_eq!(send_signal(0, Signal::Kill).unwrap(), Delivery::Gone);
    }

    #[test]
    fn test_unreaped_child_is_zombie() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as Pid;
        assert!(is_running(pid));

        assert_eq!(send_signal(pid, Signal::Kill).unwrap(), Delivery::Delivered);
        // Wait for the kernel to mark it exited without reaping it.
        let mut zombie = false;
        for _ in 0..50 {
            if is_zombie(pid) {
                zombie = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(zombie, "killed child should be a zombie until reaped");
        assert!(is_alive(pid));
        assert!(!is_running(pid));

        child.wait().unwrap();
        assert!(!is_alive(pid));
        assert_eq!(send_signal(pid, Signal::Terminate).unwrap(), Delivery::Gone);
    }

    #[test]
    fn test_qemu_pattern_matches_whole_vm_name() {
        let pattern = qemu_cmdline_pattern("vm1").unwrap();
        assert!(pattern.is_match("qemu-system-x86_64 -name vm1 -m 2G"));
        assert!(pattern.is_match("qemu-system-x86_64 -m 2G -name vm1"));
        assert!(pattern.is_match("qemu-system-x86_64 -name guest=vm1,debug-threads=on"));
        assert!(pattern.is_match("qemu-system-x86_64 -drive file=/vms/vm1/disk.qcow2"));
        assert!(!pattern.is_match("qemu-system-x86_64 -name vm10 -m 2G"));
        assert!(!pattern.is_match("qemu-system-x86_64 -name myvm1"));
        assert!(!pattern.is_match("sleep 30 -name vm1"));

        let dotted = qemu_cmdline_pattern("ubuntu-24.04").unwrap();
        assert!(!dotted.is_match("qemu-system-x86_64 -name ubuntu-24x04"));
    }

    #[test]
    fn test_parse_stat_state_handles_odd_comm() {
        assert_eq!(parse_stat_state("42 (qemu) S 1 42"), Some('S'));
        assert_eq!(parse_stat_state("42 (a) b) Z 1 42"), Some('Z'));
        assert_eq!(parse_stat_state("garbage"), None);
    }

    #[test]
    fn test_parse_ssh_port() {
        let cases = [
            ("-netdev user,id=n0,hostfwd=tcp::2222-:22", Some(2222)),
            (
                "-netdev user,hostfwd=tcp:127.0.0.1:2201-10.0.2.15:22,hostfwd=tcp::8080-:80",
                Some(2201),
            ),
            ("-netdev user,hostfwd=tcp::8080-:80", None),
            ("-netdev user,hostfwd=tcp::2300-:2222", None),
            ("-nographic", None),
        ];
        for (cmd, expected) in cases {
            assert_eq!(parse_ssh_port(cmd), expected, "{}", cmd);
        }
    }

    #[test]
    fn test_cmdline_of_self() {
        let own = cmdline(std::process::id() as Pid).unwrap();
        assert!(!own.is_empty());
    }

    #[test]
    fn test_find_qemu_process_by_vm_name() {
        let vm = format!("findme-{}", std::process::id());
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30; :", "qemu-system-x86_64"])
            .args(["-name", &vm])
            .spawn()
            .unwrap();

        let pid = child.id() as Pid;
        // Allow the exec to land so /proc/<pid>/cmdline is the shell's.
        let mut found = None;
        for _ in 0..50 {
            found = find_qemu_process(&vm);
            if found.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(found, Some(pid));
        assert_eq!(find_qemu_process("no-such-vm-anywhere-xyz"), None);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_usage_of_self() {
        let usage = usage(std::process::id() as Pid).unwrap();
        assert!(usage.memory_bytes > 0);
    }
}
