use std::path::Path;
use tracing::error;

use crate::enforcer::state::StateFile;

/// Decide whether a login attempt should proceed, from the PAM path
///
/// Performs a fresh read of the state file; the long-running agent need not
/// be alive. Every failure mode is fail-open: a missing file, a missing user
/// record or an unreadable/corrupt file all allow the login. Only an
/// explicit `blocked` record denies, and the stored reason is surfaced so
/// the authentication prompt can show it.
///
/// Returns `(allowed, reason)`. Must never panic.
pub fn check_login_allowed(state_path: &Path, username: &str) -> (bool, String) {
    if !state_path.exists() {
        return (true, String::new());
    }

    let content = match std::fs::read_to_string(state_path) {
        Ok(content) => content,
        Err(e) => {
            error!("Login check failed to read {}: {}", state_path.display(), e);
            return (true, String::new());
        }
    };

    let file: StateFile = match serde_json::from_str(&content) {
        Ok(file) => file,
        Err(e) => {
            error!("Login check failed to parse {}: {}", state_path.display(), e);
            return (true, String::new());
        }
    };

    match file.users.get(username) {
        Some(state) if state.blocked => {
            let reason = if state.block_reason.is_empty() {
                "Access blocked".to_string()
            } else {
                state.block_reason.clone()
            };
            (false, reason)
        }
        _ => (true, String::new()),
    }
}
