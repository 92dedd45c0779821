/// Enforcement engine for per-user screen-time policy
///
/// This module owns the authoritative per-user state machine:
/// - daily usage budgets and bonus time
/// - allowed-hours schedule windows
/// - pausing with auto-resume
/// - warning-threshold deduplication
/// - the time-request workflow
/// - the persisted state contract read by the login gate

pub mod engine;
pub mod schedule;
pub mod state;

pub use engine::{Enforcer, UserStatus};
pub use state::{StateStore, TimeRequest, UserState};
