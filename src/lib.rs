//! qvm: session tracking and per-VM identity for QEMU virtual machines.
//!
//! The library answers which VMs are running, stops and reaps them, recovers
//! sessions whose bookkeeping was lost, and keeps every VM's hardware, disk
//! and firmware identifiers unique.
//!
//! # Example
//!
//! ```no_run
//! use qvm::config::QvmConfig;
//! use qvm::paths::VmClass;
//! use qvm::session::SessionManager;
//!
//! let config = QvmConfig::load()?;
//! let sessions = SessionManager::for_class(&config, VmClass::Linux);
//! if sessions.is_vm_running("ubuntu") {
//!     sessions.stop_session("ubuntu", false);
//! }
//! # Ok::<(), qvm::Error>(())
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod identity;
pub mod paths;
pub mod process;
pub mod session;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
