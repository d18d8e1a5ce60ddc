//! Role artifacts the playbooks copy to the hosts: playbooks, service
//! configuration, unit files and Consul policies.

use anyhow::Result;
use minijinja::context;
use tracing::info;

use crate::config::Settings;
use crate::consul;
use crate::fs_util;
use crate::inventory::Inventory;
use crate::layout::Layout;
use crate::templates::TemplateRegistry;

const PLAYBOOKS: [&str; 5] = ["base", "consul", "vault", "nomad", "observability"];

/// (template, destination relative to the base directory)
const ROLE_ARTIFACTS: [(&str, &str); 11] = [
    ("consul/server.j2", "consul/server.j2"),
    ("consul/client.j2", "consul/client.j2"),
    ("consul/consul.service", "consul/consul.service"),
    ("fabio/fabio.properties.j2", "fabio/fabio.properties.j2"),
    ("fabio/fabio.service", "fabio/fabio.service"),
    ("nomad/server.j2", "nomad/server.j2"),
    ("nomad/client.j2", "nomad/client.j2"),
    ("nomad/nomad.service", "nomad/nomad.service"),
    ("nomad/web.hcl", "nomad/web.hcl"),
    ("vault/config.hcl.j2", "vault/config.hcl.j2"),
    ("vault/vault.service", "vault/vault.service"),
];

/// Renders every role artifact for the current inventory.
///
/// # Errors
/// Returns an error if a template fails to render or a file cannot be written.
pub fn render_role_artifacts(
    settings: &Settings,
    layout: &Layout,
    inventory: &Inventory,
) -> Result<()> {
    let registry = TemplateRegistry::global()?;
    let groups = inventory.groups();
    let ctx = context! {
        datacenter => &settings.dc_name,
        base_dir => layout.base_dir().display().to_string(),
        user => settings.cluster_user(),
        join_addresses => groups.consul_servers.private_addresses(),
        server_addresses => groups.nomad_servers.private_addresses(),
        network_interface => &settings.cloud_provider_config.internal_network_interface_name,
        management_domain => &settings.cluster_config.ingress.management_domain,
    };

    fs_util::ensure_artifact_dir(layout.base_dir())?;
    for playbook in PLAYBOOKS {
        registry.render_to(
            &format!("ansible/{playbook}.yml"),
            &ctx,
            &layout.playbook(playbook),
        )?;
    }
    for role in ["consul", "fabio", "nomad", "vault"] {
        fs_util::ensure_artifact_dir(&layout.role_dir(role))?;
    }
    for (template, destination) in ROLE_ARTIFACTS {
        registry.render_to(template, &ctx, &layout.base_dir().join(destination))?;
    }
    consul::write_policy_files(layout, inventory)?;
    info!(base_dir = %layout.base_dir().display(), "rendered role artifacts");
    Ok(())
}
