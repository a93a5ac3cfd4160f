//! Session tracking for running VM processes.

mod integrity;
mod manager;
mod record;
mod store;
mod sweeper;

pub use integrity::{audit_session, IntegrityReport};
pub use manager::{SessionManager, SessionStats};
pub use record::{SessionRecord, SessionStatus, UNKNOWN};
pub use store::{select_backend, LegacyBackend, SessionBackend, SessionStore, StructuredBackend};
pub use sweeper::Sweeper;
