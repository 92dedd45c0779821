/// OS collaborator boundary
///
/// Everything the engine and the accounting loop need from the operating
/// system goes through this trait: session enumeration, idle and lock
/// signals, session termination and on-screen warnings. The engine never
/// shells out directly, which keeps policy decisions testable.
pub mod common;
pub mod linux;

use std::collections::HashSet;

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Usernames with at least one active login session
    fn logged_in_users(&self) -> HashSet<String>;

    /// Seconds since the user's session last saw input (0 if unknown)
    fn user_idle_seconds(&self, username: &str) -> u64;

    /// Whether the user's session is sitting at the lock screen
    fn is_session_locked(&self, username: &str) -> bool;

    /// Terminate all of the user's sessions
    ///
    /// Tries the clean method first, then a forceful fallback. Returns
    /// whether either succeeded.
    fn terminate_session(&self, username: &str) -> bool;

    /// Show an on-screen warning dialog in the user's session
    fn show_warning(&self, username: &str, title: &str, message: &str);
}

/// The platform implementation for the running OS
pub fn system_platform() -> linux::LinuxPlatform {
    linux::LinuxPlatform::new()
}
