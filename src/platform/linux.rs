use std::collections::HashSet;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Platform;
use super::common::output_with_timeout;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Linux implementation backed by systemd-logind and X11 tools
pub struct LinuxPlatform {
    _private: (),
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Find the logind session ID for a user
    fn user_session_id(&self, username: &str) -> Option<String> {
        let output = output_with_timeout(
            Command::new("loginctl").args(["list-sessions", "--no-legend"]),
            COMMAND_TIMEOUT,
        )
        .ok()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 && parts[2] == username {
                return Some(parts[0].to_string());
            }
        }
        None
    }

    /// Read one property of a logind session, e.g. "Display" or "LockedHint"
    fn session_property(&self, session_id: &str, property: &str) -> Option<String> {
        let output = output_with_timeout(
            Command::new("loginctl").args(["show-session", session_id, "-p", property]),
            COMMAND_TIMEOUT,
        )
        .ok()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.trim();
        let value = line.strip_prefix(&format!("{}=", property))?;
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn user_uid(&self, username: &str) -> Option<String> {
        let output =
            output_with_timeout(Command::new("id").args(["-u", username]), COMMAND_TIMEOUT)
                .ok()?;
        if !output.status.success() {
            return None;
        }
        let uid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if uid.is_empty() { None } else { Some(uid) }
    }

    /// Candidate Xauthority locations for a user, most likely first
    fn xauthority_paths(&self, username: &str, uid: &str) -> Vec<String> {
        vec![
            format!("/run/user/{}/gdm/Xauthority", uid),
            format!("/home/{}/.Xauthority", username),
            format!("/run/user/{}/.Xauthority", uid),
        ]
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn logged_in_users(&self) -> HashSet<String> {
        let mut users = HashSet::new();

        match output_with_timeout(&mut Command::new("who"), COMMAND_TIMEOUT) {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                for line in stdout.lines() {
                    if let Some(name) = line.split_whitespace().next() {
                        users.insert(name.to_string());
                    }
                }
            }
            Err(e) => warn!("Failed to enumerate logged in users: {:#}", e),
        }

        users
    }

    fn user_idle_seconds(&self, username: &str) -> u64 {
        let Some(session_id) = self.user_session_id(username) else {
            return 0;
        };
        let Some(display) = self.session_property(&session_id, "Display") else {
            return 0;
        };
        let Some(uid) = self.user_uid(username) else {
            return 0;
        };

        // xprintidle must run inside the user's X session
        for xauth in self.xauthority_paths(username, &uid) {
            let result = output_with_timeout(
                Command::new("sudo")
                    .args(["-u", username, "xprintidle"])
                    .env("DISPLAY", &display)
                    .env("XAUTHORITY", &xauth),
                COMMAND_TIMEOUT,
            );

            if let Ok(output) = result {
                if output.status.success() {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    // xprintidle reports milliseconds
                    if let Ok(ms) = stdout.trim().parse::<u64>() {
                        return ms / 1000;
                    }
                }
            }
        }

        0
    }

    fn is_session_locked(&self, username: &str) -> bool {
        let Some(session_id) = self.user_session_id(username) else {
            return false;
        };

        self.session_property(&session_id, "LockedHint")
            .map(|v| v == "yes")
            .unwrap_or(false)
    }

    fn terminate_session(&self, username: &str) -> bool {
        // Clean method: let logind tear the sessions down
        match output_with_timeout(
            Command::new("loginctl").args(["terminate-user", username]),
            TERMINATE_TIMEOUT,
        ) {
            Ok(output) if output.status.success() => {
                info!("Terminated sessions for {} via loginctl", username);
                return true;
            }
            Ok(_) => {}
            Err(e) => warn!("loginctl terminate-user failed for {}: {:#}", username, e),
        }

        // Forceful fallback: kill every process the user owns
        match output_with_timeout(
            Command::new("pkill").args(["-KILL", "-u", username]),
            TERMINATE_TIMEOUT,
        ) {
            Ok(output) if output.status.success() => {
                info!("Killed processes for {} via pkill", username);
                true
            }
            Ok(_) => {
                warn!("Failed to terminate sessions for {}", username);
                false
            }
            Err(e) => {
                warn!("pkill failed for {}: {:#}", username, e);
                false
            }
        }
    }

    fn show_warning(&self, username: &str, title: &str, message: &str) {
        let Some(session_id) = self.user_session_id(username) else {
            debug!("No session found for {}, skipping warning dialog", username);
            return;
        };
        let Some(display) = self.session_property(&session_id, "Display") else {
            debug!("No display found for {}, skipping warning dialog", username);
            return;
        };

        let result = output_with_timeout(
            Command::new("sudo")
                .args([
                    "-u",
                    username,
                    "zenity",
                    "--warning",
                    &format!("--title={}", title),
                    &format!("--text={}", message),
                    "--width=300",
                ])
                .env("DISPLAY", &display),
            COMMAND_TIMEOUT,
        );

        match result {
            Ok(output) if output.status.success() => {
                info!("Warning shown to {}: {}", username, title)
            }
            Ok(_) | Err(_) => warn!("Failed to show warning dialog to {}", username),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xauthority_candidates_cover_common_locations() {
        let platform = LinuxPlatform::new();
        let paths = platform.xauthority_paths("alice", "1000");

        assert_eq!(paths.len(), 3);
        assert!(paths[0].contains("/run/user/1000/"));
        assert!(paths[1].contains("/home/alice/"));
    }

    #[test]
    fn logged_in_users_survives_missing_tools() {
        // Enumeration is best-effort; a broken environment yields an empty
        // set rather than a panic.
        let platform = LinuxPlatform::new();
        let _ = platform.logged_in_users();
    }
}
