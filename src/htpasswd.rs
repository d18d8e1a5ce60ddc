//! Basic-auth credentials file for the Consul UI ingress.

use std::path::Path;

use anyhow::{Context, Result};
use bcrypt::{DEFAULT_COST, Version};

use crate::fs_util;

/// Salted bcrypt hash of `password` in the `$2y$` form htpasswd writes.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn bcrypt_hash(password: &str) -> Result<String> {
    let hash = bcrypt::hash_with_result(password, DEFAULT_COST)
        .context("Failed to hash htpasswd password")?;
    Ok(hash.format_for_version(Version::TwoY))
}

/// Sets `user`'s password in the htpasswd file at `path`, keeping every other
/// entry. The file is created with mode 0600 when missing.
///
/// # Errors
/// Returns an error if the file cannot be read or written, or hashing fails.
pub fn set_password(path: &Path, user: &str, password: &str) -> Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let prefix = format!("{user}:");
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    lines.push(format!("{user}:{}", bcrypt_hash(password)?));
    let mut contents = lines.join("\n");
    contents.push('\n');
    if let Some(dir) = path.parent() {
        fs_util::ensure_secrets_dir(dir)?;
    }
    fs_util::write_private(path, contents)
}
