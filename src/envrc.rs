//! `.envrc` for operators: points the `consul`, `vault` and `nomad` CLIs at
//! the cluster with the bootstrap credentials.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::consul::client::CONSUL_HTTPS_PORT;
use crate::credentials::{self, Secrets};
use crate::error::Error;
use crate::fs_util;
use crate::inventory::Inventory;
use crate::layout::Layout;
use crate::nomad::NOMAD_HTTPS_PORT;
use crate::vault::client::VAULT_PORT;

pub const SEPARATOR: &str = "### GENERATED CONFIG BELOW THIS LINE, DO NOT EDIT!";
const ENVRC_FILE: &str = ".envrc";

/// The generated block, without the separator line.
///
/// # Errors
/// Returns [`Error::EmptyGroup`] when Consul, Nomad or Vault has no hosts.
pub fn render_env(layout: &Layout, inventory: &Inventory, secrets: &Secrets) -> Result<String, Error> {
    let groups = inventory.groups();
    let consul = groups.consul_servers.first_host("consul_servers")?;
    let vault = groups.vault_servers.first_host("vault_servers")?;
    let nomad = groups.nomad_servers.first_host("nomad_servers")?;
    Ok(format!(
        "export CONSUL_HTTP_ADDR=https://{consul}:{CONSUL_HTTPS_PORT}
export CONSUL_HTTP_TOKEN={token}
export CONSUL_HTTP_SSL=true
export CONSUL_HTTP_SSL_VERIFY=false
export CONSUL_CLIENT_CERT={consul_cert}
export CONSUL_CLIENT_KEY={consul_key}

export VAULT_ADDR=https://{vault}:{VAULT_PORT}
export VAULT_SKIP_VERIFY=true

export NOMAD_ADDR=https://{nomad}:{NOMAD_HTTPS_PORT}
export NOMAD_CACERT={nomad_ca}
export NOMAD_CLIENT_CERT={nomad_cert}
export NOMAD_CLIENT_KEY={nomad_key}
",
        token = secrets.consul_bootstrap_token.as_str(),
        consul_cert = layout.consul_client_cert().display(),
        consul_key = layout.consul_client_key().display(),
        nomad_ca = layout.nomad_ca_cert().display(),
        nomad_cert = layout.nomad_client_cert().display(),
        nomad_key = layout.nomad_client_key().display(),
    ))
}

/// Joins the operator's own lines from `existing` with a fresh generated block.
///
/// # Errors
/// Returns an error if `existing` lacks the separator line.
pub fn merge(existing: Option<&str>, generated: &str) -> Result<String> {
    let preamble = match existing {
        None => "",
        Some(contents) => match contents.split_once(SEPARATOR) {
            Some((preamble, _)) => preamble.trim_end(),
            None => anyhow::bail!(
                "{ENVRC_FILE} file exists, but is not separated by the line\n{SEPARATOR}"
            ),
        },
    };
    if preamble.is_empty() {
        Ok(format!("{SEPARATOR}\n{generated}"))
    } else {
        Ok(format!("{preamble}\n\n{SEPARATOR}\n{generated}"))
    }
}

/// Writes `<target_dir>/.envrc` from the stored inventory and secrets.
///
/// # Errors
/// Returns an error if the inventory or secrets cannot be loaded, the existing
/// file has no separator, or the file cannot be written.
pub fn generate(layout: &Layout, target_dir: &Path) -> Result<PathBuf> {
    let secrets = credentials::load(layout.base_dir())?;
    let inventory = Inventory::load(&layout.inventory())?;
    let generated = render_env(layout, &inventory, &secrets)?;

    let path = target_dir.join(ENVRC_FILE);
    let existing = match std::fs::read_to_string(&path) {
        Ok(contents) => Some(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).with_context(|| format!("Failed to read {}", path.display())),
    };
    let contents = merge(existing.as_deref(), &generated)?;
    fs_util::write_private(&path, contents)?;
    info!(path = %path.display(), "wrote environment file");
    Ok(path)
}
