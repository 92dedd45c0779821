use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

/// Atomically write content to a file
///
/// Writes to a temporary file in the same directory, syncs to disk, then
/// renames to the target path so readers (the login gate, status tools)
/// never observe a half-written state file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path).with_context(|| {
            format!("Failed to create temporary file: {}", temp_path.display())
        })?;

        file.write_all(content)
            .context("Failed to write to temporary file")?;

        file.sync_all().context("Failed to sync file to disk")?;
    }

    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

/// Ensure a directory exists, creating it and all parents if needed
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }

    Ok(())
}

/// Set file or directory permissions to a specific mode
pub fn set_file_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;

    let mut permissions = metadata.permissions();
    permissions.set_mode(mode);

    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;

    Ok(())
}

/// Check if running with root privileges
pub fn is_root() -> bool {
    let euid = unsafe { libc::geteuid() };
    euid == 0
}

/// Run a command and collect its output, killing it after `timeout`
///
/// Session enumeration and notification helpers talk to external tools
/// (loginctl, xprintidle, notify-send) that can hang when a session is in a
/// bad state. All collaborator calls go through this bounded wait.
pub fn output_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().context("Failed to spawn command")?;
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait().context("Failed to poll command")? {
            Some(_) => {
                return child
                    .wait_with_output()
                    .context("Failed to collect command output");
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("Command timed out after {:?}", timeout);
            }
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    }
}
