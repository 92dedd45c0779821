use anyhow::{Context, Result};
use serde::Deserialize;

fn default_minutes() -> u32 {
    15
}

/// An inbound control command
///
/// Arrives as JSON `{"action": "...", "user": ..., ...}` from whatever
/// transport the deployment wires up. A command without a `user` applies to
/// every controlled user. An unknown action fails to parse and is dropped by
/// the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Block the user and terminate their sessions
    Lock { user: Option<String> },
    /// Allow the user to log in again
    Unlock { user: Option<String> },
    /// Suspend usage accrual
    Pause { user: Option<String> },
    /// Resume usage accrual
    Resume { user: Option<String> },
    /// Grant bonus minutes for today
    AddTime {
        user: Option<String>,
        #[serde(default = "default_minutes")]
        minutes: u32,
    },
    /// File a time-extension request on a user's behalf
    RequestTime {
        user: String,
        #[serde(default = "default_minutes")]
        minutes: u32,
        #[serde(default)]
        reason: String,
    },
    /// Grant the pending request as bonus time
    ApproveRequest { user: Option<String> },
    /// Clear the pending request without granting anything
    DenyRequest { user: Option<String> },
}

impl Command {
    /// Parse a command from its JSON wire form
    pub fn parse(input: &str) -> Result<Self> {
        serde_json::from_str(input).context("Failed to parse command")
    }
}

/// File-based command channel
///
/// An admin-only drop directory for control commands, the file counterpart
/// of the message-bus command topic. Each file holds one JSON command and is
/// consumed exactly once; a file that does not parse is logged and deleted.
pub struct CommandChannel {
    dir: std::path::PathBuf,
}

const SYSTEM_COMMAND_DIR: &str = "/var/lib/timewarden/commands";

impl CommandChannel {
    pub fn new(dir: std::path::PathBuf) -> Self {
        Self { dir }
    }

    /// The command directory for this host (user-dir fallback when not root)
    pub fn default_dir() -> std::path::PathBuf {
        if crate::platform::common::is_root() {
            return std::path::PathBuf::from(SYSTEM_COMMAND_DIR);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "timewarden") {
            return dirs.data_local_dir().join("commands");
        }

        std::path::PathBuf::from(SYSTEM_COMMAND_DIR)
    }

    /// Create the drop directory, writable by root only
    ///
    /// Unlike the request channel this must not be world-writable: anyone
    /// who can drop a file here can unlock users.
    pub fn ensure_dir(&self) -> Result<()> {
        crate::platform::common::ensure_directory_exists(&self.dir)?;
        crate::platform::common::set_file_permissions(&self.dir, 0o700)?;
        Ok(())
    }

    /// Consume every pending command file
    pub fn drain(&self) -> Vec<Command> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut commands = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| Command::parse(&content))
            {
                Ok(command) => commands.push(command),
                Err(e) => {
                    tracing::error!("Invalid command file {}: {:#}", path.display(), e)
                }
            }

            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove command file {}: {}", path.display(), e);
            }
        }

        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_targeted_lock() {
        let cmd = Command::parse(r#"{"action": "lock", "user": "alice"}"#).unwrap();
        assert_eq!(cmd, Command::Lock {
            user: Some("alice".to_string())
        });
    }

    #[test]
    fn parses_broadcast_pause() {
        let cmd = Command::parse(r#"{"action": "pause"}"#).unwrap();
        assert_eq!(cmd, Command::Pause { user: None });
    }

    #[test]
    fn add_time_defaults_to_fifteen_minutes() {
        let cmd = Command::parse(r#"{"action": "add_time", "user": "alice"}"#).unwrap();
        assert_eq!(cmd, Command::AddTime {
            user: Some("alice".to_string()),
            minutes: 15,
        });
    }

    #[test]
    fn parses_request_time_with_reason() {
        let cmd = Command::parse(
            r#"{"action": "request_time", "user": "alice", "minutes": 30, "reason": "homework"}"#,
        )
        .unwrap();
        assert_eq!(cmd, Command::RequestTime {
            user: "alice".to_string(),
            minutes: 30,
            reason: "homework".to_string(),
        });
    }

    #[test]
    fn unknown_action_fails_to_parse() {
        assert!(Command::parse(r#"{"action": "explode"}"#).is_err());
    }

    #[test]
    fn malformed_json_fails_to_parse() {
        assert!(Command::parse("{nope").is_err());
    }

    #[test]
    fn request_time_requires_a_user() {
        assert!(Command::parse(r#"{"action": "request_time"}"#).is_err());
    }

    #[test]
    fn command_channel_consumes_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let channel = CommandChannel::new(dir.path().to_path_buf());

        std::fs::write(
            dir.path().join("cmd.json"),
            r#"{"action": "unlock", "user": "alice"}"#,
        )
        .unwrap();

        let commands = channel.drain();
        assert_eq!(commands, vec![Command::Unlock {
            user: Some("alice".to_string())
        }]);
        assert!(channel.drain().is_empty());
        assert!(!dir.path().join("cmd.json").exists());
    }

    #[test]
    fn command_channel_deletes_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let channel = CommandChannel::new(dir.path().to_path_buf());

        std::fs::write(dir.path().join("bad.json"), r#"{"action": "explode"}"#).unwrap();

        assert!(channel.drain().is_empty());
        assert!(!dir.path().join("bad.json").exists());
    }
}
