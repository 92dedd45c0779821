use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Device identity
    #[serde(default)]
    pub device: DeviceConfig,

    /// Polling and accrual behavior
    #[serde(default)]
    pub activity: ActivityConfig,

    /// Controlled users
    pub users: Vec<UserConfig>,

    /// Fixed UTC offset (in minutes) governing day boundaries and schedule
    /// windows. Absent means the system local timezone.
    #[serde(default)]
    pub timezone_offset_minutes: Option<i32>,
}

/// Device identity configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Polling and accrual configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActivityConfig {
    /// Tick period of the accounting loop, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Idle minutes after which usage stops accruing (0 disables idle detection)
    #[serde(default)]
    pub idle_threshold_minutes: u32,

    /// Minutes after which a paused timer resumes on its own
    #[serde(default = "default_pause_auto_resume")]
    pub pause_auto_resume: u32,

    /// Whether to watch for backward wall-clock jumps
    #[serde(default = "default_true")]
    pub tamper_detection: bool,

    /// Minimum backward jump, in seconds, that counts as tampering
    #[serde(default = "default_tamper_threshold")]
    pub tamper_threshold_secs: i64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            idle_threshold_minutes: 0,
            pause_auto_resume: default_pause_auto_resume(),
            tamper_detection: true,
            tamper_threshold_secs: default_tamper_threshold(),
        }
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_pause_auto_resume() -> u32 {
    30
}

fn default_tamper_threshold() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

/// Per-user policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    /// OS account name
    pub username: String,

    /// Daily budget in minutes (0 = unlimited)
    #[serde(default)]
    pub daily_minutes: u32,

    /// Allowed-hours windows
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Warning thresholds in minutes remaining, most distant first
    #[serde(default = "default_warnings")]
    pub warnings: Vec<u32>,
}

fn default_warnings() -> Vec<u32> {
    vec![10, 5, 1]
}

/// Allowed-hours windows, one for weekdays and one for weekends
///
/// Each window is an inclusive `"HH:MM-HH:MM"` range. A malformed window is
/// treated as always-allowed at evaluation time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_window")]
    pub weekday: String,

    #[serde(default = "default_window")]
    pub weekend: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            weekday: default_window(),
            weekend: default_window(),
        }
    }
}

fn default_window() -> String {
    "00:00-23:59".to_string()
}

impl Config {
    /// Look up a controlled user by name
    pub fn get_user(&self, username: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.username == username)
    }
}

const SYSTEM_CONFIG_FILE: &str = "/etc/timewarden/config.yaml";

/// The configuration file location for this host
///
/// The system path is preferred; a per-user config is the fallback for
/// unprivileged runs.
pub fn get_config_path() -> PathBuf {
    let system = PathBuf::from(SYSTEM_CONFIG_FILE);
    if system.exists() || crate::platform::common::is_root() {
        return system;
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "timewarden") {
        return dirs.config_dir().join("config.yaml");
    }

    system
}

/// Load configuration from a YAML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Validate configuration
///
/// Schedule window strings are deliberately NOT validated here: a malformed
/// window fails open at evaluation time, and rejecting the whole config for
/// one bad string would take every other user's policy down with it. A
/// warning is logged instead.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.users.is_empty() {
        anyhow::bail!("Configuration must specify at least one user");
    }

    let mut names = std::collections::HashSet::new();
    for user in &config.users {
        if user.username.is_empty() {
            anyhow::bail!("Username cannot be empty");
        }

        if !names.insert(&user.username) {
            anyhow::bail!("Duplicate username: {}", user.username);
        }

        for i in 1..user.warnings.len() {
            if user.warnings[i] >= user.warnings[i - 1] {
                anyhow::bail!(
                    "Warning thresholds for '{}' must be in descending order, got: {:?}",
                    user.username,
                    user.warnings
                );
            }
        }

        for window in [&user.schedule.weekday, &user.schedule.weekend] {
            if !looks_like_window(window) {
                tracing::warn!(
                    "Schedule window '{}' for '{}' does not look like HH:MM-HH:MM; \
                     it will be treated as always-allowed",
                    window,
                    user.username
                );
            }
        }
    }

    if config.activity.poll_interval == 0 {
        anyhow::bail!("activity.poll_interval must be at least 1 second");
    }

    if let Some(offset) = config.timezone_offset_minutes {
        if !(-14 * 60..=14 * 60).contains(&offset) {
            anyhow::bail!("timezone_offset_minutes out of range: {}", offset);
        }
    }

    Ok(())
}

/// Example configuration file content, written by `timewarden init`
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");

fn looks_like_window(window: &str) -> bool {
    window
        .split_once('-')
        .map(|(a, b)| {
            chrono::NaiveTime::parse_from_str(a.trim(), "%H:%M").is_ok()
                && chrono::NaiveTime::parse_from_str(b.trim(), "%H:%M").is_ok()
        })
        .unwrap_or(false)
}
