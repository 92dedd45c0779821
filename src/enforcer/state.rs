use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// A pending time-extension request
///
/// At most one exists per user; creating a new one overwrites the old.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeRequest {
    pub id: String,
    pub minutes: u32,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user enforcement state, persisted across agent restarts
///
/// `usage_minutes`, `bonus_minutes` and `warnings_sent` are scoped to the
/// calendar day recorded in `last_usage_date` and reset together when the
/// engine first observes a newer date. `blocked`, `paused` and
/// `pending_request` survive the rollover.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UserState {
    pub usage_minutes: u32,
    pub last_usage_date: Option<NaiveDate>,
    pub blocked: bool,
    pub block_reason: String,
    pub paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub bonus_minutes: u32,
    pub warnings_sent: BTreeSet<u32>,
    /// Most recent idle/lock observation. Runtime only, never persisted.
    #[serde(skip)]
    pub is_idle: bool,
    pub pending_request: Option<TimeRequest>,
}

impl UserState {
    /// Reset the day-scoped counters if the stored date is not `today`
    ///
    /// Returns true when a rollover happened. Block, pause and pending
    /// request state are deliberately left alone; lifting those takes an
    /// explicit unblock, resume or deny.
    pub fn roll_over_if_stale(&mut self, today: NaiveDate) -> bool {
        if self.last_usage_date == Some(today) {
            return false;
        }

        self.usage_minutes = 0;
        self.bonus_minutes = 0;
        self.warnings_sent.clear();
        self.last_usage_date = Some(today);
        true
    }
}

/// On-disk layout of the state file: a mapping from username to state
///
/// Every field of every record defaults when absent so older or newer
/// writers can share the file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StateFile {
    pub users: BTreeMap<String, UserState>,
}

/// Durable store for the per-user state map
///
/// The file is rewritten in full after every mutation (write-through) and
/// left world-readable so the login gate and status tools can read it from
/// separate processes.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

const SYSTEM_STATE_FILE: &str = "/var/lib/timewarden/state.json";

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The state file location for this host
    ///
    /// Root uses the system path; otherwise fall back to the user state
    /// directory so a non-privileged run (development, tests) still works.
    pub fn default_path() -> PathBuf {
        if crate::platform::common::is_root() {
            return PathBuf::from(SYSTEM_STATE_FILE);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "timewarden") {
            return dirs.data_local_dir().join("state.json");
        }

        PathBuf::from(SYSTEM_STATE_FILE)
    }

    /// Load the full user map from disk
    ///
    /// A missing file is an empty map. A corrupt file is logged and treated
    /// as empty rather than failing the agent; the next save replaces it.
    pub fn load(&self) -> BTreeMap<String, UserState> {
        if !self.path.exists() {
            return BTreeMap::new();
        }

        match self.try_load() {
            Ok(file) => file.users,
            Err(e) => {
                tracing::error!("Failed to load state from {}: {:#}", self.path.display(), e);
                BTreeMap::new()
            }
        }
    }

    fn try_load(&self) -> Result<StateFile> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))
    }

    /// Persist the full user map to disk
    pub fn save(&self, users: &BTreeMap<String, UserState>) -> Result<()> {
        let file = StateFile {
            users: users.clone(),
        };

        let content =
            serde_json::to_string_pretty(&file).context("Failed to serialize state")?;

        crate::platform::common::atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write state file: {}", self.path.display()))?;

        // Readable by all users so the tray indicator and login gate can
        // inspect it without privileges.
        crate::platform::common::set_file_permissions(&self.path, 0o644)?;

        Ok(())
    }
}
