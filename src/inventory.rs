//! Ansible inventory derived from provisioner output.
//!
//! The provisioner reports flat lists of hosts per role and of volumes keyed
//! by numeric server id. [`Inventory::build`] folds those into the role →
//! host-group tree that configuration management and every bootstrap phase
//! read back from `<base_dir>/inventory`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::fs_util;

const CONSUL_MOUNT_NAME: &str = "consul";
const CONSUL_MOUNT_PATH: &str = "/opt/consul";
const CONSUL_OWNER: &str = "consul";
const EXTRA_VAR_BOOTSTRAP_EXPECT: &str = "bootstrap_expect";
const EXTRA_VAR_DATACENTER: &str = "datacenter";

/// Raw `terraform output -json` document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvisionerOutput {
    #[serde(default)]
    pub client_servers: OutputList<RawHost>,
    #[serde(default)]
    pub nomad_servers: OutputList<RawHost>,
    #[serde(default)]
    pub o11y_servers: OutputList<RawHost>,
    #[serde(default)]
    pub vault_servers: OutputList<RawHost>,
    #[serde(default)]
    pub consul_servers: OutputList<RawHost>,
    #[serde(default)]
    pub consul_volumes: OutputList<RawVolume>,
    #[serde(default)]
    pub client_volumes: OutputList<RawVolume>,
}

impl ProvisionerOutput {
    /// Parses the provisioner's JSON output.
    ///
    /// # Errors
    /// Returns an error if the document does not match the expected shape.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse provisioner output")
    }

    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&contents)
    }
}

/// Terraform wraps every output in `{ "value": ... }`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputList<T> {
    pub value: Vec<T>,
}

impl<T> Default for OutputList<T> {
    fn default() -> Self {
        Self { value: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawHost {
    /// Public identifier, used as the inventory host key.
    pub host: String,
    pub host_name: String,
    pub private_ip: String,
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawVolume {
    /// Device path on the attached server.
    pub mount: String,
    pub name: String,
    pub path: String,
    pub server_id: u64,
    #[serde(default)]
    pub size: Option<u64>,
}

impl RawVolume {
    fn attached_to(&self, host: &RawHost) -> bool {
        self.server_id.to_string() == host.server_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub all: All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct All {
    pub children: Groups,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Groups {
    #[serde(default)]
    pub clients: HostGroup,
    #[serde(default)]
    pub nomad_servers: HostGroup,
    #[serde(default)]
    pub vault_servers: HostGroup,
    #[serde(default)]
    pub consul_servers: HostGroup,
    #[serde(default)]
    pub prometheus: HostGroup,
    #[serde(default)]
    pub grafana: HostGroup,
    #[serde(default)]
    pub loki: HostGroup,
    #[serde(default)]
    pub tempo: HostGroup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostGroup {
    #[serde(default)]
    pub hosts: BTreeMap<String, Host>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub private_ip: String,
    pub host_name: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub extra_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub path: String,
    pub mount_path: String,
    pub is_nomad: bool,
    pub owner: String,
}

impl HostGroup {
    /// Public host identifiers in inventory order.
    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        self.hosts.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn private_addresses(&self) -> Vec<&str> {
        self.hosts.values().map(|host| host.private_ip.as_str()).collect()
    }

    #[must_use]
    pub fn host_names(&self) -> Vec<&str> {
        self.hosts.values().map(|host| host.host_name.as_str()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// First public identifier, used as the entry point for API calls.
    ///
    /// # Errors
    /// Returns [`Error::EmptyGroup`] when the group has no hosts.
    pub fn first_host(&self, group: &'static str) -> Result<&str, Error> {
        self.hosts
            .keys()
            .next()
            .map(String::as_str)
            .ok_or(Error::EmptyGroup(group))
    }

    /// First private address of the group.
    ///
    /// # Errors
    /// Returns [`Error::EmptyGroup`] when the group has no hosts.
    pub fn first_private_address(&self, group: &'static str) -> Result<&str, Error> {
        self.hosts
            .values()
            .next()
            .map(|host| host.private_ip.as_str())
            .ok_or(Error::EmptyGroup(group))
    }
}

/// How observability roles are spread over the observability hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservabilityPlacement {
    /// One host runs metrics, logs, traces and the dashboard.
    Single(RawHost),
    /// One host per role: grafana, prometheus, loki, tempo.
    Quad([RawHost; 4]),
}

impl ObservabilityPlacement {
    /// # Errors
    /// Returns [`Error::ObservabilityHostCount`] unless exactly one or four hosts are given.
    pub fn from_hosts(hosts: &[RawHost]) -> Result<Self, Error> {
        match hosts {
            [single] => Ok(Self::Single(single.clone())),
            [grafana, prometheus, loki, tempo] => Ok(Self::Quad([
                grafana.clone(),
                prometheus.clone(),
                loki.clone(),
                tempo.clone(),
            ])),
            _ => Err(Error::ObservabilityHostCount(hosts.len())),
        }
    }

    fn grafana(&self) -> &RawHost {
        match self {
            Self::Single(host) => host,
            Self::Quad(hosts) => &hosts[0],
        }
    }

    fn prometheus(&self) -> &RawHost {
        match self {
            Self::Single(host) => host,
            Self::Quad(hosts) => &hosts[1],
        }
    }

    fn loki(&self) -> &RawHost {
        match self {
            Self::Single(host) => host,
            Self::Quad(hosts) => &hosts[2],
        }
    }

    fn tempo(&self) -> &RawHost {
        match self {
            Self::Single(host) => host,
            Self::Quad(hosts) => &hosts[3],
        }
    }
}

fn plain_host(raw: &RawHost) -> Host {
    Host {
        private_ip: raw.private_ip.clone(),
        host_name: raw.host_name.clone(),
        ..Host::default()
    }
}

fn single_host_group(raw: &RawHost) -> HostGroup {
    HostGroup {
        hosts: BTreeMap::from([(raw.host.clone(), plain_host(raw))]),
    }
}

fn server_vars(expect: usize, datacenter: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (EXTRA_VAR_BOOTSTRAP_EXPECT.to_string(), expect.to_string()),
        (EXTRA_VAR_DATACENTER.to_string(), datacenter.to_string()),
    ])
}

impl Inventory {
    /// Derives the inventory from raw provisioner output.
    ///
    /// # Errors
    /// Returns [`Error::ObservabilityHostCount`] when the observability host
    /// count is neither one nor four.
    pub fn build(
        output: &ProvisionerOutput,
        datacenter: &str,
        cluster_user: &str,
    ) -> Result<Self, Error> {
        let placement = ObservabilityPlacement::from_hosts(&output.o11y_servers.value)?;
        let mut groups = Groups::default();

        let consul_hosts = if output.consul_servers.value.is_empty() {
            &output.nomad_servers.value
        } else {
            &output.consul_servers.value
        };
        for raw in consul_hosts {
            let mounts = output
                .consul_volumes
                .value
                .iter()
                .find(|volume| volume.attached_to(raw))
                .map(|volume| {
                    vec![Mount {
                        name: CONSUL_MOUNT_NAME.to_string(),
                        path: CONSUL_MOUNT_PATH.to_string(),
                        mount_path: volume.mount.clone(),
                        is_nomad: false,
                        owner: CONSUL_OWNER.to_string(),
                    }]
                })
                .unwrap_or_default();
            groups.consul_servers.hosts.insert(
                raw.host.clone(),
                Host {
                    mounts,
                    extra_vars: server_vars(consul_hosts.len(), datacenter),
                    ..plain_host(raw)
                },
            );
        }

        let nomad_count = output.nomad_servers.value.len();
        for raw in &output.nomad_servers.value {
            groups.nomad_servers.hosts.insert(
                raw.host.clone(),
                Host {
                    extra_vars: server_vars(nomad_count, datacenter),
                    ..plain_host(raw)
                },
            );
        }

        for raw in &output.vault_servers.value {
            groups.vault_servers.hosts.insert(raw.host.clone(), plain_host(raw));
        }

        for raw in &output.client_servers.value {
            let mounts = output
                .client_volumes
                .value
                .iter()
                .filter(|volume| volume.attached_to(raw))
                .map(|volume| Mount {
                    name: volume.name.clone(),
                    path: volume.path.clone(),
                    mount_path: volume.mount.clone(),
                    is_nomad: true,
                    owner: cluster_user.to_string(),
                })
                .collect();
            groups.clients.hosts.insert(
                raw.host.clone(),
                Host {
                    mounts,
                    ..plain_host(raw)
                },
            );
        }

        groups.grafana = single_host_group(placement.grafana());
        groups.prometheus = single_host_group(placement.prometheus());
        groups.loki = single_host_group(placement.loki());
        groups.tempo = single_host_group(placement.tempo());

        Ok(Self {
            all: All { children: groups },
        })
    }

    #[must_use]
    pub fn groups(&self) -> &Groups {
        &self.all.children
    }

    /// Groups in the order used for address aggregation.
    fn ordered_groups(&self) -> [&HostGroup; 8] {
        let groups = &self.all.children;
        [
            &groups.clients,
            &groups.consul_servers,
            &groups.nomad_servers,
            &groups.vault_servers,
            &groups.prometheus,
            &groups.grafana,
            &groups.loki,
            &groups.tempo,
        ]
    }

    /// Every private address and DNS name in the cluster, deduplicated in
    /// first-seen order.
    #[must_use]
    pub fn all_private_addresses(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut addresses = Vec::new();
        for group in self.ordered_groups() {
            let candidates = group
                .private_addresses()
                .into_iter()
                .chain(group.host_names());
            for candidate in candidates {
                if seen.insert(candidate) {
                    addresses.push(candidate.to_string());
                }
            }
        }
        addresses
    }

    /// Private addresses of every observability host, deduplicated.
    #[must_use]
    pub fn observability_addresses(&self) -> Vec<String> {
        let groups = &self.all.children;
        let mut seen = HashSet::new();
        [&groups.tempo, &groups.prometheus, &groups.loki, &groups.grafana]
            .into_iter()
            .flat_map(HostGroup::private_addresses)
            .filter(|address| seen.insert(*address))
            .map(str::to_string)
            .collect()
    }

    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse inventory {}", path.display()))
    }

    /// # Errors
    /// Returns an error if the inventory cannot be serialized or written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize inventory")?;
        fs_util::write_private(path, contents)
    }
}
