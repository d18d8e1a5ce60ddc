use std::collections::HashSet;

use anyhow::Result;

use super::{ClusterSettings, SUPPORTED_PROVIDER, Settings};
use crate::error::Error;

pub(crate) fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.dc_name.trim().is_empty() {
        anyhow::bail!("dc_name must not be empty");
    }
    if settings.dc_name.chars().any(char::is_whitespace) {
        anyhow::bail!("dc_name must not contain whitespace");
    }
    if settings.base_dir.as_os_str().is_empty() {
        anyhow::bail!("base_dir must not be empty");
    }
    if settings.org_name.trim().is_empty() {
        anyhow::bail!("org_name must not be empty");
    }
    if settings.org_name.contains('/') {
        anyhow::bail!("org_name must not contain '/'");
    }

    let provider = &settings.cloud_provider_config;
    if provider.provider != SUPPORTED_PROVIDER {
        return Err(Error::UnsupportedProvider(provider.provider.clone()).into());
    }
    if provider.sudo_user.trim().is_empty() {
        anyhow::bail!("cloud_provider_config.sudo_user must not be empty");
    }
    if provider.internal_network_interface_name.trim().is_empty() {
        anyhow::bail!("cloud_provider_config.internal_network_interface_name must not be empty");
    }

    validate_cluster(&settings.cluster_config)?;

    if settings.observability_config.tempo_bucket.trim().is_empty() {
        anyhow::bail!("observability_config.tempo_bucket must not be empty");
    }
    if settings.observability_config.loki_bucket.trim().is_empty() {
        anyhow::bail!("observability_config.loki_bucket must not be empty");
    }

    let node_wait = settings.node_wait()?;
    if node_wait.is_zero() {
        anyhow::bail!("bootstrap.node_wait must be greater than 0");
    }
    let period = settings.vault_token_period()?;
    if period.is_zero() {
        anyhow::bail!("bootstrap.vault_token_period must be greater than 0");
    }
    if settings.bootstrap.kv_mount.trim_matches('/').is_empty() {
        anyhow::bail!("bootstrap.kv_mount must not be empty");
    }
    if !settings.bootstrap.cloudflare_url.starts_with("http://")
        && !settings.bootstrap.cloudflare_url.starts_with("https://")
    {
        anyhow::bail!("bootstrap.cloudflare_url must be an http(s) URL");
    }
    Ok(())
}

fn validate_cluster(cluster: &ClusterSettings) -> Result<()> {
    if cluster.servers == 0 {
        anyhow::bail!("cluster_config.servers must be greater than 0");
    }
    if cluster.vault_servers == 0 {
        anyhow::bail!("cluster_config.vault_servers must be greater than 0");
    }
    if cluster.consul_volume_size == 0 {
        anyhow::bail!("cluster_config.consul_volume_size must be greater than 0");
    }
    if cluster.ingress.management_domain.trim().is_empty() {
        anyhow::bail!("cluster_config.ingress.management_domain must not be empty");
    }

    let mut names = HashSet::new();
    for volume in &cluster.client_volumes {
        if !names.insert(volume.name.as_str()) {
            anyhow::bail!("cluster_config.client_volumes has duplicate name {}", volume.name);
        }
        let index: u32 = volume.client.parse().map_err(|_| {
            anyhow::anyhow!(
                "cluster_config.client_volumes[{}].client must be a client index",
                volume.name
            )
        })?;
        if index >= cluster.clients {
            anyhow::bail!(
                "cluster_config.client_volumes[{}].client must be less than cluster_config.clients",
                volume.name
            );
        }
        if volume.size == 0 {
            anyhow::bail!(
                "cluster_config.client_volumes[{}].size must be greater than 0",
                volume.name
            );
        }
        if !volume.path.starts_with('/') {
            anyhow::bail!(
                "cluster_config.client_volumes[{}].path must be absolute",
                volume.name
            );
        }
    }
    Ok(())
}
