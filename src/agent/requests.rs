use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, warn};
use uuid::Uuid;

fn default_minutes() -> u32 {
    15
}

/// A time-extension request dropped into the request directory
///
/// Written by the user-side `request` command (or the tray applet), consumed
/// by the agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRequest {
    pub username: String,
    #[serde(default = "default_minutes")]
    pub minutes: u32,
    #[serde(default)]
    pub reason: String,
}

/// File-based time-request channel
///
/// A world-writable drop directory: any session can submit a request without
/// talking to the agent process. Each file is consumed exactly once:
/// processed then deleted, or deleted on parse failure.
pub struct RequestChannel {
    dir: PathBuf,
}

const SYSTEM_REQUEST_DIR: &str = "/var/lib/timewarden/requests";

impl RequestChannel {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The request directory for this host (user-dir fallback when not root)
    pub fn default_dir() -> PathBuf {
        if crate::platform::common::is_root() {
            return PathBuf::from(SYSTEM_REQUEST_DIR);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "timewarden") {
            return dirs.data_local_dir().join("requests");
        }

        PathBuf::from(SYSTEM_REQUEST_DIR)
    }

    /// Create the drop directory, writable by every user
    pub fn ensure_dir(&self) -> Result<()> {
        crate::platform::common::ensure_directory_exists(&self.dir)?;
        crate::platform::common::set_file_permissions(&self.dir, 0o777)?;
        Ok(())
    }

    /// Drop a request file for the agent to pick up
    pub fn submit(&self, request: &FileRequest) -> Result<()> {
        crate::platform::common::ensure_directory_exists(&self.dir)?;

        let path = self.dir.join(format!("{}.json", Uuid::new_v4()));
        let content =
            serde_json::to_string_pretty(request).context("Failed to serialize request")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write request file: {}", path.display()))?;

        Ok(())
    }

    /// Consume every pending request file
    ///
    /// Files are deleted whether or not they parse; a stuck file must not be
    /// retried forever.
    pub fn drain(&self) -> Vec<FileRequest> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut requests = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| {
                    serde_json::from_str::<FileRequest>(&content).map_err(anyhow::Error::from)
                }) {
                Ok(request) => requests.push(request),
                Err(e) => error!("Invalid request file {}: {:#}", path.display(), e),
            }

            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove request file {}: {}", path.display(), e);
            }
        }

        requests
    }
}
