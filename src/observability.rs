//! Metrics, logs and traces: renders the observability stack's configuration,
//! publishes each role in the Consul catalog behind the Fabio ingress and
//! runs the `observability.yml` playbook.

use std::path::PathBuf;

use anyhow::{Context, Result};
use minijinja::context;
use tracing::info;

use crate::ansible::ConfigManagement;
use crate::config::Settings;
use crate::consul::client::{CONSUL_HTTPS_PORT, ConsulApi};
use crate::fs_util;
use crate::inventory::{Groups, HostGroup, Inventory};
use crate::layout::Layout;
use crate::nomad::NOMAD_HTTPS_PORT;
use crate::templates::TemplateRegistry;

const ROLE_DIRS: [&str; 6] = ["prometheus", "loki", "grafana", "intentions", "tempo", "consul"];
const NODE_EXPORTER_PORT: u16 = 9100;

/// Role configuration and unit files: (template, destination under the base directory).
const ROLE_FILES: [(&str, &str); 5] = [
    ("observability/prometheus.service", "prometheus/prometheus.service"),
    ("observability/loki.service", "loki/loki.service"),
    ("observability/promtail.service", "loki/promtail.service"),
    ("observability/tempo.service", "tempo/tempo.service"),
    ("observability/grafana-datasources.yml", "grafana/datasources.yml"),
];

/// A role published in the Consul catalog and routed by Fabio.
struct IngressService {
    name: &'static str,
    group: &'static str,
    hosts: fn(&Groups) -> &HostGroup,
    role_dir: &'static str,
    port: u16,
    health_check: Option<&'static str>,
    route: &'static str,
    route_options: &'static str,
}

const SERVICES: [IngressService; 6] = [
    IngressService {
        name: "tempo-grpc",
        group: "tempo",
        hosts: |groups| &groups.tempo,
        role_dir: "tempo",
        port: 4317,
        health_check: None,
        route: "tempo-grpc",
        route_options: " proto=grpc",
    },
    IngressService {
        name: "tempo",
        group: "tempo",
        hosts: |groups| &groups.tempo,
        role_dir: "tempo",
        port: 3200,
        health_check: Some("http://{address}:3200/ready"),
        route: "tempo",
        route_options: "",
    },
    IngressService {
        name: "prometheus",
        group: "prometheus",
        hosts: |groups| &groups.prometheus,
        role_dir: "prometheus",
        port: 9090,
        health_check: Some("http://{address}:9090/-/ready"),
        route: "prometheus",
        route_options: "",
    },
    IngressService {
        name: "loki",
        group: "loki",
        hosts: |groups| &groups.loki,
        role_dir: "loki",
        port: 3100,
        health_check: Some("http://{address}:3100/ready"),
        route: "loki",
        route_options: "",
    },
    IngressService {
        name: "grafana",
        group: "grafana",
        hosts: |groups| &groups.grafana,
        role_dir: "grafana",
        port: 3000,
        health_check: Some("http://{address}:3000/api/health"),
        route: "grafana",
        route_options: "",
    },
    IngressService {
        name: "consul-ingress",
        group: "consul_servers",
        hosts: |groups| &groups.consul_servers,
        role_dir: "consul",
        port: CONSUL_HTTPS_PORT,
        health_check: Some("https://{address}:8501/v1/status/leader"),
        route: "consul",
        route_options: " proto=https tlsskipverify=true",
    },
];

/// Catalog files written for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFiles {
    pub name: &'static str,
    pub definition: PathBuf,
    pub intention: PathBuf,
}

/// Scrape targets for the Prometheus configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeTargets {
    pub consul: Vec<String>,
    pub nomad: Vec<String>,
    pub node: Vec<String>,
}

impl ScrapeTargets {
    /// Consul agents run on clients and Consul servers, Nomad agents on
    /// clients and Nomad servers; every host runs the node exporter.
    #[must_use]
    pub fn from_inventory(inventory: &Inventory) -> Self {
        let groups = inventory.groups();
        let clients = groups.clients.private_addresses();
        let with_port = |addresses: Vec<&str>, port: u16| -> Vec<String> {
            let mut targets: Vec<String> = Vec::new();
            for address in addresses {
                let target = format!("{address}:{port}");
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
            targets
        };

        let consul = with_port(
            [clients.clone(), groups.consul_servers.private_addresses()].concat(),
            CONSUL_HTTPS_PORT,
        );
        let nomad = with_port(
            [clients.clone(), groups.nomad_servers.private_addresses()].concat(),
            NOMAD_HTTPS_PORT,
        );
        let observability = inventory.observability_addresses();
        let node = with_port(
            [
                clients,
                groups.nomad_servers.private_addresses(),
                groups.consul_servers.private_addresses(),
                groups.vault_servers.private_addresses(),
                observability.iter().map(String::as_str).collect(),
            ]
            .concat(),
            NODE_EXPORTER_PORT,
        );
        Self { consul, nomad, node }
    }
}

/// Writes every observability artifact under the base directory and returns
/// the catalog files to register.
///
/// # Errors
/// Returns an error if a role group is empty, a template fails to render or a
/// file cannot be written.
pub fn write_configs(
    settings: &Settings,
    layout: &Layout,
    inventory: &Inventory,
) -> Result<Vec<ServiceFiles>> {
    let registry = TemplateRegistry::global()?;
    let groups = inventory.groups();
    for dir in ROLE_DIRS {
        fs_util::ensure_artifact_dir(&layout.role_dir(dir))?;
    }

    let targets = ScrapeTargets::from_inventory(inventory);
    registry.render_to(
        "observability/prometheus.yml",
        context! {
            consul_targets => targets.consul,
            nomad_targets => targets.nomad,
            node_targets => targets.node,
            consul_server => groups.consul_servers.first_private_address("consul_servers")?,
        },
        &layout.role_dir("prometheus").join("prometheus.yml"),
    )?;

    let loki_address = groups.loki.first_private_address("loki")?;
    registry.render_to(
        "observability/loki.yml",
        context! { bucket => &settings.observability_config.loki_bucket },
        &layout.role_dir("loki").join("loki.yml"),
    )?;
    registry.render_to(
        "observability/promtail.yml",
        context! { loki_address, datacenter => &settings.dc_name },
        &layout.role_dir("loki").join("promtail.yml"),
    )?;
    registry.render_to(
        "observability/tempo.yml",
        context! { bucket => &settings.observability_config.tempo_bucket },
        &layout.role_dir("tempo").join("tempo.yml"),
    )?;
    let datasources = context! {
        prometheus_address => groups.prometheus.first_private_address("prometheus")?,
        loki_address,
        tempo_address => groups.tempo.first_private_address("tempo")?,
    };
    for (template, destination) in ROLE_FILES {
        registry.render_to(template, &datasources, &layout.base_dir().join(destination))?;
    }

    let domain = &settings.cluster_config.ingress.management_domain;
    let mut written = Vec::with_capacity(SERVICES.len());
    for service in &SERVICES {
        let address = (service.hosts)(groups).first_private_address(service.group)?;
        let definition = layout
            .role_dir(service.role_dir)
            .join(format!("{}.hcl", service.name));
        registry.render_to(
            "consul/service.hcl",
            context! {
                name => service.name,
                address,
                port => service.port,
                tags => vec![format!("urlprefix-{}.{domain}/{}", service.route, service.route_options)],
                http_check => service.health_check.map(|check| check.replace("{address}", address)),
            },
            &definition,
        )?;
        let intention = layout
            .role_dir("intentions")
            .join(format!("{}.hcl", service.name));
        registry.render_to("consul/intention.hcl", context! { service => service.name }, &intention)?;
        written.push(ServiceFiles {
            name: service.name,
            definition,
            intention,
        });
    }
    info!(services = written.len(), "rendered observability configuration");
    Ok(written)
}

/// Registers each service, then its intention, in order.
///
/// # Errors
/// Returns the first rejected registration.
pub fn register_services(consul: &dyn ConsulApi, services: &[ServiceFiles]) -> Result<()> {
    for service in services {
        consul
            .register_service(&service.definition)
            .with_context(|| format!("Failed to register service {}", service.name))?;
        consul
            .write_config_entry(&service.intention)
            .with_context(|| format!("Failed to write intention for {}", service.name))?;
        info!(service = service.name, "registered service");
    }
    Ok(())
}

/// Full observability setup: configuration, catalog registration and the
/// `observability.yml` playbook.
///
/// # Errors
/// Returns an error if any step fails; later steps are not attempted.
pub fn setup(
    settings: &Settings,
    layout: &Layout,
    inventory: &Inventory,
    consul: &dyn ConsulApi,
    playbooks: &dyn ConfigManagement,
) -> Result<()> {
    let services = write_configs(settings, layout, inventory)?;
    register_services(consul, &services)?;
    playbooks.run(&layout.playbook("observability"))
}
