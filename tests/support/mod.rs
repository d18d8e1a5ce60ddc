// Helpers are shared across test crates; not every helper is used in each.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use stackroot::Settings;

pub(crate) const ROOT_TOKEN: &str = "root-token";

pub(crate) fn config_yaml(base_dir: &Path, cloudflare_url: &str) -> String {
    format!(
        r#"dc_name: dc1
base_dir: {base_dir}
org_name: Example
cloud_provider_config:
  sudo_user: ops
  sudo_dir: /home/ops
  provider: hetzner
  provider_settings:
    location: fsn1
    ssh_keys: ["ops-key"]
    allowed_ips: []
    server_instance_type: cx21
    client_instance_type: cx31
    observability_instance_type: cx21
    resource_names:
      base_server_name: dc1
      firewall_name: dc1-fw
      network_name: dc1-net
cluster_config:
  servers: 1
  clients: 1
  consul_volume_size: 10
  vault_servers: 1
  separate_consul_servers: false
  client_volumes: []
  ingress:
    management_domain: mgmt.example.com
observability_config:
  tempo_bucket: traces
  loki_bucket: logs
  multi_instance: false
bootstrap:
  node_wait: 1ms
  cloudflare_url: {cloudflare_url}
"#,
        base_dir = base_dir.display(),
    )
}

pub(crate) fn write_config(dir: &Path, base_dir: &Path) -> PathBuf {
    let path = dir.join("stackroot.yml");
    fs::write(&path, config_yaml(base_dir, "https://www.cloudflare.com")).expect("write config");
    path
}

pub(crate) fn load_settings(dir: &Path, base_dir: &Path) -> Settings {
    Settings::load(&write_config(dir, base_dir)).expect("settings")
}
