//! CLI command implementations.

pub mod ident;
pub mod session;

use qvm::config::QvmConfig;
use qvm::paths::VmClass;
use serde::Serialize;

/// Settings shared by every command.
pub struct Context {
    /// Loaded configuration.
    pub config: QvmConfig,
    /// VM namespace to operate on.
    pub class: VmClass,
    /// Emit JSON instead of text.
    pub json: bool,
}

/// Print a value as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> qvm::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Truncate a string for table display.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
