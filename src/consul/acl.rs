//! One-time ACL bootstrap of the Consul cluster.
//!
//! Whether the bootstrap already happened is read from the secrets record: a
//! pending bootstrap token means nothing has been issued yet. Later runs only
//! refresh the node policy so new hosts can register.

use anyhow::{Context, Result};
use minijinja::context;
use tracing::info;

use super::client::ConsulApi;
use crate::credentials::{self, Secrets, Token};
use crate::fs_util;
use crate::inventory::Inventory;
use crate::layout::Layout;
use crate::templates::{self, TemplateRegistry};

const NODE_POLICY: &str = "consul-policies";
const ANONYMOUS_POLICY: &str = "anonymous-dns-read";
const ANONYMOUS_TOKEN_ID: &str = "anonymous";

/// Policies in registration order: (policy name, file stem under `consul/`).
const POLICIES: [(&str, &str); 7] = [
    (NODE_POLICY, "consul-policies"),
    ("nomad-client", "nomad-client-policy"),
    ("fabio", "fabio-policy"),
    ("nomad-server", "nomad-server-policy"),
    ("prometheus", "prometheus-policy"),
    (ANONYMOUS_POLICY, "anonymous-policy"),
    ("vault", "vault-policy"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclState {
    Unbootstrapped,
    Bootstrapped,
}

impl AclState {
    #[must_use]
    pub fn of(secrets: &Secrets) -> Self {
        if secrets.consul_bootstrap_token.is_pending() {
            Self::Unbootstrapped
        } else {
            Self::Bootstrapped
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclBootstrapResult {
    /// The bootstrap ran and new agent tokens must be distributed.
    Bootstrapped,
    /// Already bootstrapped; only the node policy was pushed again.
    Refreshed,
}

/// Service roles that get their own Consul token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleToken {
    Agent,
    NomadClient,
    NomadServer,
    Prometheus,
    Vault,
    Fabio,
}

impl RoleToken {
    pub const ALL: [Self; 6] = [
        Self::Agent,
        Self::NomadClient,
        Self::NomadServer,
        Self::Prometheus,
        Self::Vault,
        Self::Fabio,
    ];

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Agent => "agent token",
            Self::NomadClient => "client token",
            Self::NomadServer => "nomad server token",
            Self::Prometheus => "prometheus token",
            Self::Vault => "vault token",
            Self::Fabio => "fabio token",
        }
    }

    #[must_use]
    pub fn policy(self) -> &'static str {
        match self {
            Self::Agent => NODE_POLICY,
            Self::NomadClient => "nomad-client",
            Self::NomadServer => "nomad-server",
            Self::Prometheus => "prometheus",
            Self::Vault => "vault",
            Self::Fabio => "fabio",
        }
    }

    /// The secrets record field holding this role's token.
    pub fn slot(self, secrets: &mut Secrets) -> &mut Token {
        match self {
            Self::Agent => &mut secrets.consul_agent_token,
            Self::NomadClient => &mut secrets.nomad_client_consul_token,
            Self::NomadServer => &mut secrets.nomad_server_consul_token,
            Self::Prometheus => &mut secrets.prometheus_consul_token,
            Self::Vault => &mut secrets.vault_consul_token,
            Self::Fabio => &mut secrets.fabio_consul_token,
        }
    }
}

/// Renders the node policy from the inventory and writes it to `consul/`.
///
/// # Errors
/// Returns an error if rendering or writing fails.
pub fn write_node_policy(layout: &Layout, inventory: &Inventory) -> Result<()> {
    fs_util::ensure_artifact_dir(&layout.role_dir("consul"))?;
    TemplateRegistry::global()?.render_to(
        "consul/consul-policies.hcl",
        context! { nodes => inventory.all_private_addresses() },
        &layout.consul_policy(NODE_POLICY),
    )
}

/// Writes every policy file the bootstrap registers.
///
/// # Errors
/// Returns an error if a policy cannot be rendered or written.
pub fn write_policy_files(layout: &Layout, inventory: &Inventory) -> Result<()> {
    write_node_policy(layout, inventory)?;
    for (_, stem) in POLICIES.iter().filter(|(name, _)| *name != NODE_POLICY) {
        let source = templates::raw(&format!("consul/{stem}.hcl"))?;
        fs_util::write_private(&layout.consul_policy(stem), source)?;
    }
    Ok(())
}

/// Bootstraps Consul ACLs once, or refreshes the node policy on later runs.
///
/// The bootstrap token is persisted as soon as it is known, and the role
/// tokens once all of them are issued.
///
/// # Errors
/// Returns the first failing Consul call or persistence error; the remaining
/// steps are not attempted.
pub fn bootstrap_acl(
    consul: &mut dyn ConsulApi,
    inventory: &Inventory,
    secrets: &mut Secrets,
    layout: &Layout,
) -> Result<AclBootstrapResult> {
    let base_dir = layout.base_dir();
    if AclState::of(secrets) == AclState::Bootstrapped {
        write_node_policy(layout, inventory)?;
        info!("updating consul node policy");
        consul.update_policy(NODE_POLICY, &layout.consul_policy(NODE_POLICY))?;
        return Ok(AclBootstrapResult::Refreshed);
    }

    let root = consul.bootstrap().context("Consul ACL bootstrap failed")?;
    secrets.consul_bootstrap_token = Token::Issued(root);
    credentials::write(base_dir, secrets)?;
    info!("consul ACL system bootstrapped");

    write_policy_files(layout, inventory)?;
    for (name, stem) in POLICIES {
        consul.register_policy(name, &layout.consul_policy(stem))?;
    }
    consul.update_token(ANONYMOUS_TOKEN_ID, ANONYMOUS_POLICY)?;

    for role in RoleToken::ALL {
        let token = consul.create_token(role.description(), role.policy())?;
        *role.slot(secrets) = Token::Issued(token);
    }
    credentials::write(base_dir, secrets)?;
    info!(tokens = RoleToken::ALL.len(), "issued consul role tokens");
    Ok(AclBootstrapResult::Bootstrapped)
}
