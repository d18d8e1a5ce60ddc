//! The `sync` run: provision, configure and bootstrap a whole datacenter.
//!
//! Every external system is reached through a [`Backend`] factory so the
//! phase order can be exercised without a cloud account.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::ansible::{AnsibleCli, ConfigManagement};
use crate::certs::{self, CaToolchain, CliToolchain};
use crate::cloudflare;
use crate::config::Settings;
use crate::consul::{self, AclBootstrapResult, ConsulApi, ConsulCli};
use crate::credentials::{self, Secrets};
use crate::fs_util;
use crate::htpasswd;
use crate::inventory::Inventory;
use crate::layout::Layout;
use crate::nomad::{NomadCli, Scheduler};
use crate::observability;
use crate::render;
use crate::terraform::{self, Provisioner, TerraformCli};
use crate::vault::{self, VaultApi, VaultClient};

const HTPASSWD_USER: &str = "consul";

/// Factories for the collaborators of a bootstrap run.
pub trait Backend {
    type Vault: VaultApi;

    fn provisioner(&self, layout: &Layout) -> Box<dyn Provisioner>;

    fn playbooks(
        &self,
        layout: &Layout,
        user: &str,
        config_path: &Path,
    ) -> Box<dyn ConfigManagement>;

    fn toolchain(&self) -> &dyn CaToolchain;

    /// # Errors
    /// Returns an error if the inventory has no Consul server.
    fn consul(
        &self,
        layout: &Layout,
        inventory: &Inventory,
        secrets: &Secrets,
    ) -> Result<Box<dyn ConsulApi>>;

    /// One client per Vault host, in inventory order.
    ///
    /// # Errors
    /// Returns an error if a client cannot be built.
    fn vault_nodes(&self, inventory: &Inventory) -> Result<Vec<Self::Vault>>;

    /// # Errors
    /// Returns an error if the inventory has no Nomad server.
    fn scheduler(&self, layout: &Layout, inventory: &Inventory) -> Result<Box<dyn Scheduler>>;

    /// Lookup for operator-supplied credentials.
    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// The locally installed toolchain plus HTTP access to Vault.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliBackend;

impl Backend for CliBackend {
    type Vault = VaultClient;

    fn provisioner(&self, layout: &Layout) -> Box<dyn Provisioner> {
        Box::new(TerraformCli::from_env(layout))
    }

    fn playbooks(
        &self,
        layout: &Layout,
        user: &str,
        config_path: &Path,
    ) -> Box<dyn ConfigManagement> {
        Box::new(AnsibleCli::new(layout, user, config_path))
    }

    fn toolchain(&self) -> &dyn CaToolchain {
        &CliToolchain
    }

    fn consul(
        &self,
        layout: &Layout,
        inventory: &Inventory,
        secrets: &Secrets,
    ) -> Result<Box<dyn ConsulApi>> {
        Ok(Box::new(ConsulCli::new(layout, inventory, secrets)?))
    }

    fn vault_nodes(&self, inventory: &Inventory) -> Result<Vec<VaultClient>> {
        inventory
            .groups()
            .vault_servers
            .hosts()
            .into_iter()
            .map(VaultClient::for_host)
            .collect()
    }

    fn scheduler(&self, layout: &Layout, inventory: &Inventory) -> Result<Box<dyn Scheduler>> {
        Ok(Box::new(NomadCli::new(layout, inventory)?))
    }
}

/// Runs every bootstrap phase in order; the first failure stops the run.
///
/// Each phase is idempotent, so a failed run can simply be repeated.
///
/// # Errors
/// Returns the first failing phase's error with context naming the phase.
pub async fn sync<B: Backend>(settings: &Settings, config_path: &Path, backend: &B) -> Result<()> {
    settings.validate()?;
    let layout = settings.layout();
    fs_util::ensure_artifact_dir(layout.base_dir())?;

    let inventory = provision(settings, &layout, backend).await?;

    render::render_role_artifacts(settings, &layout, &inventory)
        .context("Failed to render role artifacts")?;
    credentials::ensure(layout.base_dir(), |key| backend.env_var(key))?;
    certs::issue_consul_certs(backend.toolchain(), &layout, &settings.dc_name)?;

    let wait = settings.node_wait()?;
    info!(wait = %humantime::format_duration(wait), "waiting for nodes to boot");
    tokio::time::sleep(wait).await;

    let playbooks = backend.playbooks(&layout, settings.cluster_user(), config_path);
    playbooks.run(&layout.playbook("base"))?;
    playbooks.run(&layout.playbook("consul"))?;

    let mut secrets = credentials::load(layout.base_dir())?;
    let mut consul_api = backend.consul(&layout, &inventory, &secrets)?;
    let acl = consul::bootstrap_acl(consul_api.as_mut(), &inventory, &mut secrets, &layout)
        .context("Consul ACL setup failed")?;
    if acl == AclBootstrapResult::Bootstrapped {
        info!("re-applying consul configuration with agent tokens");
        playbooks.run(&layout.playbook("consul"))?;
    }

    certs::issue_nomad_certs(backend.toolchain(), &layout, &inventory)?;
    certs::issue_vault_tls(backend.toolchain(), &layout, &settings.org_name, &inventory)?;

    let secrets = credentials::load(layout.base_dir())?;
    htpasswd::set_password(
        &layout.htpasswd_file(),
        HTPASSWD_USER,
        secrets.consul_bootstrap_token.as_str(),
    )?;

    playbooks.run(&layout.playbook("vault"))?;
    let mut secrets = credentials::load(layout.base_dir())?;
    let mut nodes = backend.vault_nodes(&inventory)?;
    let outcome = vault::initialize_vault(&mut nodes, &mut secrets, &layout, settings)
        .await
        .context("Vault initialization failed")?;
    info!(?outcome, "vault ready");

    playbooks.run(&layout.playbook("nomad"))?;
    backend
        .scheduler(&layout, &inventory)?
        .run_job(&layout.canary_job())
        .context("Canary job submission failed")?;

    let secrets = credentials::load(layout.base_dir())?;
    let consul_api = backend.consul(&layout, &inventory, &secrets)?;
    observability::setup(
        settings,
        &layout,
        &inventory,
        consul_api.as_ref(),
        playbooks.as_ref(),
    )
    .context("Observability setup failed")?;

    info!(datacenter = %settings.dc_name, "sync complete");
    Ok(())
}

/// Fetches the ingress allow-list, applies the infrastructure and persists
/// the inventory derived from it.
async fn provision<B: Backend>(
    settings: &Settings,
    layout: &Layout,
    backend: &B,
) -> Result<Inventory> {
    let ranges = cloudflare::fetch_ips(&settings.bootstrap.cloudflare_url).await?;
    terraform::render_definitions(settings, layout, &ranges.all())?;
    let output = backend
        .provisioner(layout)
        .apply(layout)
        .context("Provisioning failed")?;
    let inventory = Inventory::build(&output, &settings.dc_name, settings.cluster_user())?;
    inventory.save(&layout.inventory())?;
    info!(path = %layout.inventory().display(), "saved inventory");
    Ok(inventory)
}

/// The standalone `observability` command: reuses the stored inventory and
/// secrets of a previous `sync`.
///
/// # Errors
/// Returns an error if the stored state is missing or any setup step fails.
pub fn setup_observability<B: Backend>(
    settings: &Settings,
    config_path: &Path,
    backend: &B,
) -> Result<()> {
    settings.validate()?;
    let layout = settings.layout();
    let inventory = Inventory::load(&layout.inventory())?;
    let secrets = credentials::load(layout.base_dir())?;
    let consul_api = backend.consul(&layout, &inventory, &secrets)?;
    let playbooks = backend.playbooks(&layout, settings.cluster_user(), config_path);
    observability::setup(
        settings,
        &layout,
        &inventory,
        consul_api.as_ref(),
        playbooks.as_ref(),
    )
}
