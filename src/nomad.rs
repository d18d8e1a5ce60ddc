use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::error::Error;
use crate::inventory::Inventory;
use crate::layout::Layout;
use crate::runtime::{self, Environment, quote};

pub const NOMAD_HTTPS_PORT: u16 = 4646;

/// Job submission through the scheduler.
pub trait Scheduler {
    /// # Errors
    /// Returns an error if the job is rejected or the scheduler is unreachable.
    fn run_job(&self, job: &Path) -> Result<()>;
}

/// `nomad job run` against the first Nomad server, authenticated with the
/// client certificate.
#[derive(Debug, Clone)]
pub struct NomadCli {
    address: String,
    ca_cert: PathBuf,
    client_cert: PathBuf,
    client_key: PathBuf,
}

impl NomadCli {
    /// # Errors
    /// Returns [`Error::EmptyGroup`] when the inventory has no Nomad servers.
    pub fn new(layout: &Layout, inventory: &Inventory) -> Result<Self, Error> {
        let host = inventory.groups().nomad_servers.first_host("nomad_servers")?;
        Ok(Self {
            address: format!("https://{host}:{NOMAD_HTTPS_PORT}"),
            ca_cert: layout.nomad_ca_cert(),
            client_cert: layout.nomad_client_cert(),
            client_key: layout.nomad_client_key(),
        })
    }
}

impl Environment for NomadCli {
    fn variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("NOMAD_ADDR".to_string(), self.address.clone()),
            ("NOMAD_CACERT".to_string(), self.ca_cert.display().to_string()),
            (
                "NOMAD_CLIENT_CERT".to_string(),
                self.client_cert.display().to_string(),
            ),
            (
                "NOMAD_CLIENT_KEY".to_string(),
                self.client_key.display().to_string(),
            ),
        ])
    }
}

impl Scheduler for NomadCli {
    fn run_job(&self, job: &Path) -> Result<()> {
        info!(job = %job.display(), address = %self.address, "submitting nomad job");
        runtime::exec(self, &format!("nomad job run {}", quote(&job.to_string_lossy())))
            .with_context(|| format!("Failed to submit {}", job.display()))
    }
}
