use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

use crate::platform::common::output_with_timeout;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Notification urgency, mapped onto notify-send levels
#[derive(Debug, Clone, Copy)]
pub enum Urgency {
    Normal,
    Critical,
}

impl Urgency {
    fn as_str(self) -> &'static str {
        match self {
            Urgency::Normal => "normal",
            Urgency::Critical => "critical",
        }
    }
}

/// Desktop-notification collaborator boundary
///
/// The agent calls these; delivery is someone else's problem. Every method
/// returns whether the notification actually went out, so callers can avoid
/// marking warnings as sent when nothing reached the screen.
pub trait Notifier: Send + Sync {
    fn send_time_warning(&self, username: &str, minutes_left: i64) -> bool;

    fn send_paused_notification(&self, username: &str, paused: bool) -> bool;

    fn send_bonus_time_notification(&self, username: &str, minutes: u32) -> bool;

    fn send_request_submitted(&self, username: &str) -> bool;

    fn send_request_approved(&self, username: &str, minutes: u32) -> bool;

    fn send_request_denied(&self, username: &str) -> bool;
}

/// Sends desktop notifications into a specific user's session
///
/// The agent runs as root outside any graphical session, so each send has to
/// discover the target user's DISPLAY and session bus before invoking
/// notify-send as that user. All failures are logged and swallowed; a missed
/// notification never affects enforcement.
pub struct DesktopNotifier {
    _private: (),
}

impl DesktopNotifier {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn user_uid(&self, username: &str) -> Option<String> {
        let output =
            output_with_timeout(Command::new("id").args(["-u", username]), LOOKUP_TIMEOUT)
                .ok()?;
        if !output.status.success() {
            return None;
        }
        let uid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if uid.is_empty() { None } else { Some(uid) }
    }

    fn user_display(&self, username: &str) -> Option<String> {
        let output = output_with_timeout(
            Command::new("loginctl").args(["list-sessions", "--no-legend"]),
            LOOKUP_TIMEOUT,
        )
        .ok()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 && parts[2] == username {
                let show = output_with_timeout(
                    Command::new("loginctl").args(["show-session", parts[0], "-p", "Display"]),
                    LOOKUP_TIMEOUT,
                )
                .ok()?;
                let line = String::from_utf8_lossy(&show.stdout).trim().to_string();
                if let Some(display) = line.strip_prefix("Display=") {
                    if !display.is_empty() {
                        return Some(display.to_string());
                    }
                }
            }
        }
        None
    }

    /// Send a notification to one user; returns whether delivery succeeded
    fn send(
        &self,
        username: &str,
        title: &str,
        message: &str,
        urgency: Urgency,
        icon: &str,
        timeout_ms: u32,
    ) -> bool {
        let display = self
            .user_display(username)
            .unwrap_or_else(|| ":0".to_string());
        let dbus_addr = self
            .user_uid(username)
            .map(|uid| format!("unix:path=/run/user/{}/bus", uid));

        let mut cmd = Command::new("sudo");
        cmd.args([
            "-u",
            username,
            "notify-send",
            "--urgency",
            urgency.as_str(),
            "--icon",
            icon,
            "--expire-time",
            &timeout_ms.to_string(),
            "--app-name",
            "Timewarden",
            title,
            message,
        ])
        .env("DISPLAY", &display);

        if let Some(addr) = &dbus_addr {
            cmd.env("DBUS_SESSION_BUS_ADDRESS", addr);
        }

        match output_with_timeout(&mut cmd, NOTIFY_TIMEOUT) {
            Ok(output) if output.status.success() => {
                debug!("Sent notification to {}: {}", username, title);
                true
            }
            Ok(output) => {
                warn!(
                    "notify-send failed for {}: {}",
                    username,
                    String::from_utf8_lossy(&output.stderr)
                );
                false
            }
            Err(e) => {
                warn!("Failed to send notification to {}: {:#}", username, e);
                false
            }
        }
    }
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for DesktopNotifier {
    /// Warn the user about remaining time, scaled by how close the end is
    fn send_time_warning(&self, username: &str, minutes_left: i64) -> bool {
        let (title, message, urgency, icon, timeout) = if minutes_left <= 0 {
            (
                "Time's Up!".to_string(),
                "Your screen time is up. Logging out now...".to_string(),
                Urgency::Critical,
                "dialog-error",
                5000,
            )
        } else if minutes_left == 1 {
            (
                "1 Minute Left!".to_string(),
                "Time to save your work!".to_string(),
                Urgency::Critical,
                "dialog-warning",
                0, // stays until dismissed
            )
        } else if minutes_left <= 5 {
            (
                format!("{} Minutes Left", minutes_left),
                "Almost out of time - save your work!".to_string(),
                Urgency::Critical,
                "dialog-warning",
                15000,
            )
        } else {
            (
                format!("{} Minutes Left", minutes_left),
                format!("You have {} minutes of screen time remaining.", minutes_left),
                Urgency::Normal,
                "dialog-information",
                10000,
            )
        };

        self.send(username, &title, &message, urgency, icon, timeout)
    }

    fn send_paused_notification(&self, username: &str, paused: bool) -> bool {
        let (title, message, icon) = if paused {
            (
                "Timer Paused",
                "Your screen time timer has been paused.",
                "media-playback-pause",
            )
        } else {
            (
                "Timer Resumed",
                "Your screen time timer is now running.",
                "media-playback-start",
            )
        };

        self.send(username, title, message, Urgency::Normal, icon, 5000)
    }

    fn send_bonus_time_notification(&self, username: &str, minutes: u32) -> bool {
        self.send(
            username,
            "Bonus Time!",
            &format!("You've been given {} extra minutes of screen time!", minutes),
            Urgency::Normal,
            "face-smile",
            10000,
        )
    }

    fn send_request_submitted(&self, username: &str) -> bool {
        self.send(
            username,
            "Request Sent",
            "Your request for more time has been sent to your parent.",
            Urgency::Normal,
            "mail-send",
            5000,
        )
    }

    fn send_request_approved(&self, username: &str, minutes: u32) -> bool {
        self.send(
            username,
            "Request Approved!",
            &format!("Your request was approved! You got {} extra minutes.", minutes),
            Urgency::Normal,
            "emblem-ok",
            10000,
        )
    }

    fn send_request_denied(&self, username: &str) -> bool {
        self.send(
            username,
            "Request Denied",
            "Your request for more time was denied.",
            Urgency::Normal,
            "dialog-error",
            10000,
        )
    }
}
