use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, Result};

const PRIVATE_FILE_MODE: u32 = 0o600;
const SECRETS_DIR_MODE: u32 = 0o700;
const ARTIFACT_DIR_MODE: u32 = 0o750;

/// Ensures a directory holding secret material exists with owner-only access.
///
/// # Errors
/// Returns an error if the directory cannot be created or permissions cannot be set.
pub fn ensure_secrets_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create secrets dir {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(SECRETS_DIR_MODE))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Ensures a directory for rendered, non-secret artifacts exists.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_artifact_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(ARTIFACT_DIR_MODE))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Writes `contents` to `path` with mode 0600, replacing any previous file.
///
/// The data lands in a sibling temp file first and is renamed into place, so
/// readers never observe a half-written file.
///
/// # Errors
/// Returns an error if the temp file cannot be written or renamed.
pub fn write_private(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(PRIVATE_FILE_MODE)
            .open(&temp_path)
            .with_context(|| format!("Failed to open {}", temp_path.display()))?;
        file.write_all(contents.as_ref())
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", temp_path.display()))?;
    }
    fs::set_permissions(&temp_path, fs::Permissions::from_mode(PRIVATE_FILE_MODE))
        .with_context(|| format!("Failed to set permissions on {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// Atomically creates an empty marker file. Returns `false` when the marker
/// is already present.
///
/// # Errors
/// Returns an error for any failure other than the file already existing.
pub fn create_marker(path: &Path) -> Result<bool> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(PRIVATE_FILE_MODE)
        .open(path)
    {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to create marker {}", path.display()))
        }
    }
}

/// Removes a marker created by [`create_marker`]; a missing marker is not an error.
///
/// # Errors
/// Returns an error if the marker exists but cannot be removed.
pub fn remove_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to remove marker {}", path.display()))
        }
    }
}
