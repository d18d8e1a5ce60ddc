use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::layout::Layout;

mod defaults;
mod validation;

pub const SUPPORTED_PROVIDER: &str = "hetzner";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub dc_name: String,
    pub base_dir: PathBuf,
    pub org_name: String,
    pub cloud_provider_config: CloudProviderSettings,
    pub cluster_config: ClusterSettings,
    pub observability_config: ObservabilitySettings,
    pub bootstrap: BootstrapSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CloudProviderSettings {
    pub sudo_user: String,
    #[serde(default)]
    pub sudo_dir: String,
    pub internal_network_interface_name: String,
    pub provider: String,
    pub provider_settings: ProviderSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderSettings {
    pub location: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    pub server_instance_type: String,
    pub client_instance_type: String,
    pub observability_instance_type: String,
    pub resource_names: ResourceNames,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResourceNames {
    pub base_server_name: String,
    pub firewall_name: String,
    pub network_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClusterSettings {
    pub servers: u32,
    pub clients: u32,
    pub consul_volume_size: u32,
    pub vault_servers: u32,
    pub separate_consul_servers: bool,
    #[serde(default)]
    pub client_volumes: Vec<ClientVolume>,
    pub ingress: IngressSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientVolume {
    pub name: String,
    /// Index of the client host the volume attaches to.
    pub client: String,
    pub path: String,
    pub size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngressSettings {
    pub management_domain: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ObservabilitySettings {
    pub tempo_bucket: String,
    pub loki_bucket: String,
    pub multi_instance: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BootstrapSettings {
    /// Pause between provisioning and the first playbook run.
    pub node_wait: String,
    /// Renewal period of the scheduler's secrets-service token.
    pub vault_token_period: String,
    pub kv_mount: String,
    /// Base URL serving the `ips-v4` and `ips-v6` lists.
    pub cloudflare_url: String,
}

impl Settings {
    /// Reads settings from defaults, the YAML file at `config_path`, and
    /// `STACKROOT__`-prefixed environment variables, in that order.
    ///
    /// # Errors
    /// Returns error if the file is missing or any value has the wrong type.
    pub fn new(config_path: &Path) -> Result<Self, ConfigError> {
        let builder = defaults::apply_defaults(Config::builder())?
            .add_source(File::from(config_path).format(FileFormat::Yaml).required(true))
            // e.g. STACKROOT__CLUSTER_CONFIG__SERVERS=5
            .add_source(
                Environment::with_prefix("STACKROOT")
                    .prefix_separator("__")
                    .separator("__"),
            );
        builder.build()?.try_deserialize()
    }

    /// Loads and validates settings in one step.
    ///
    /// # Errors
    /// Returns error if loading or validation fails.
    pub fn load(config_path: &Path) -> Result<Self> {
        let settings = Self::new(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        validation::validate_settings(self)
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout::new(&self.base_dir)
    }

    #[must_use]
    pub fn cluster_user(&self) -> &str {
        &self.cloud_provider_config.sudo_user
    }

    /// Number of observability hosts the provisioner is asked for.
    #[must_use]
    pub fn observability_hosts(&self) -> usize {
        if self.observability_config.multi_instance {
            4
        } else {
            1
        }
    }

    /// # Errors
    /// Returns error if `bootstrap.node_wait` is not a valid duration.
    pub fn node_wait(&self) -> Result<Duration> {
        humantime::parse_duration(&self.bootstrap.node_wait)
            .with_context(|| format!("Invalid bootstrap.node_wait: {}", self.bootstrap.node_wait))
    }

    /// # Errors
    /// Returns error if `bootstrap.vault_token_period` is not a valid duration.
    pub fn vault_token_period(&self) -> Result<Duration> {
        humantime::parse_duration(&self.bootstrap.vault_token_period).with_context(|| {
            format!(
                "Invalid bootstrap.vault_token_period: {}",
                self.bootstrap.vault_token_period
            )
        })
    }
}
