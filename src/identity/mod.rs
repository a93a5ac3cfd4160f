//! Per-VM unique identity: generation, persistence and application.

mod bundle;
mod firmware;
mod guest;
mod launch;
mod manager;

pub use bundle::{IdentifierBundle, MAC_PREFIX};
pub use firmware::reset_firmware_vars;
pub use guest::{write_guest_script, GUEST_SCRIPT};
pub use launch::{apply_to_command, extend_command, launch_args};
pub use manager::IdentityManager;
