use config::{ConfigBuilder, ConfigError, builder::DefaultState};

use super::SUPPORTED_PROVIDER;

const DEFAULT_ORG_NAME: &str = "stackroot";
const DEFAULT_NETWORK_INTERFACE: &str = "ens10";
const DEFAULT_SERVERS: u32 = 3;
const DEFAULT_CLIENTS: u32 = 1;
const DEFAULT_VAULT_SERVERS: u32 = 1;
const DEFAULT_CONSUL_VOLUME_SIZE_GB: u32 = 10;
const DEFAULT_TEMPO_BUCKET: &str = "tempo";
const DEFAULT_LOKI_BUCKET: &str = "loki";
const DEFAULT_NODE_WAIT: &str = "10s";
const DEFAULT_VAULT_TOKEN_PERIOD: &str = "72h";
const DEFAULT_KV_MOUNT: &str = "secret";
const DEFAULT_CLOUDFLARE_URL: &str = "https://www.cloudflare.com";

pub(crate) fn apply_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("org_name", DEFAULT_ORG_NAME)?
        .set_default("cloud_provider_config.provider", SUPPORTED_PROVIDER)?
        .set_default(
            "cloud_provider_config.internal_network_interface_name",
            DEFAULT_NETWORK_INTERFACE,
        )?
        .set_default("cluster_config.servers", DEFAULT_SERVERS)?
        .set_default("cluster_config.clients", DEFAULT_CLIENTS)?
        .set_default("cluster_config.vault_servers", DEFAULT_VAULT_SERVERS)?
        .set_default(
            "cluster_config.consul_volume_size",
            DEFAULT_CONSUL_VOLUME_SIZE_GB,
        )?
        .set_default("cluster_config.separate_consul_servers", false)?
        .set_default("observability_config.tempo_bucket", DEFAULT_TEMPO_BUCKET)?
        .set_default("observability_config.loki_bucket", DEFAULT_LOKI_BUCKET)?
        .set_default("observability_config.multi_instance", false)?
        .set_default("bootstrap.node_wait", DEFAULT_NODE_WAIT)?
        .set_default("bootstrap.vault_token_period", DEFAULT_VAULT_TOKEN_PERIOD)?
        .set_default("bootstrap.kv_mount", DEFAULT_KV_MOUNT)?
        .set_default("bootstrap.cloudflare_url", DEFAULT_CLOUDFLARE_URL)
}
