//! Bundled templates for playbooks, service configuration, unit files,
//! policies and provisioner definitions.
//!
//! Templates use `[[ expr ]]`, `[% stmt %]` and `[# comment #]` so that the
//! Jinja expressions meant for Ansible (`{{ ansible_host }}`) and HCL blocks
//! pass through untouched.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::fs_util;

macro_rules! bundled {
    ($($name:literal),* $(,)?) => {
        &[$(($name, include_str!(concat!("../templates/", $name)))),*]
    };
}

/// Every template compiled into the binary, keyed by its path under `templates/`.
pub const BUNDLED: &[(&str, &str)] = bundled![
    "ansible/base.yml",
    "ansible/consul.yml",
    "ansible/nomad.yml",
    "ansible/observability.yml",
    "ansible/vault.yml",
    "consul/anonymous-policy.hcl",
    "consul/client.j2",
    "consul/consul-policies.hcl",
    "consul/consul.service",
    "consul/fabio-policy.hcl",
    "consul/intention.hcl",
    "consul/nomad-client-policy.hcl",
    "consul/nomad-server-policy.hcl",
    "consul/prometheus-policy.hcl",
    "consul/server.j2",
    "consul/service.hcl",
    "consul/vault-policy.hcl",
    "fabio/fabio.properties.j2",
    "fabio/fabio.service",
    "nomad/cfssl.json",
    "nomad/client.j2",
    "nomad/nomad.service",
    "nomad/server.j2",
    "nomad/web.hcl",
    "observability/grafana-datasources.yml",
    "observability/loki.service",
    "observability/loki.yml",
    "observability/prometheus.service",
    "observability/prometheus.yml",
    "observability/promtail.service",
    "observability/promtail.yml",
    "observability/tempo.service",
    "observability/tempo.yml",
    "terraform/hetzner/main.tf",
    "terraform/hetzner/vars.tf",
    "vault/config.hcl.j2",
    "vault/nomad-server-policy.hcl",
    "vault/token-role.json",
    "vault/vault.service",
];

static REGISTRY: LazyLock<Result<TemplateRegistry, minijinja::Error>> =
    LazyLock::new(TemplateRegistry::build);

/// Read-only template environment shared by the whole process.
pub struct TemplateRegistry {
    env: Environment<'static>,
}

impl TemplateRegistry {
    /// Returns the process-wide registry, building it on first use.
    ///
    /// # Errors
    /// Returns an error if a bundled template fails to compile.
    pub fn global() -> Result<&'static Self> {
        REGISTRY
            .as_ref()
            .map_err(|err| anyhow::anyhow!("Failed to load bundled templates: {err:#}"))
    }

    fn build() -> Result<Self, minijinja::Error> {
        let syntax = SyntaxConfig::builder()
            .block_delimiters("[%", "%]")
            .variable_delimiters("[[", "]]")
            .comment_delimiters("[#", "#]")
            .build()?;
        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);
        for (name, source) in BUNDLED {
            env.add_template(name, source)?;
        }
        Ok(Self { env })
    }

    /// Renders `name` with `context`.
    ///
    /// # Errors
    /// Returns an error if the template is unknown or references an undefined value.
    pub fn render<S: Serialize>(&self, name: &str, context: S) -> Result<String> {
        self.env
            .get_template(name)
            .with_context(|| format!("Unknown template {name}"))?
            .render(context)
            .with_context(|| format!("Failed to render template {name}"))
    }

    /// Renders `name` and writes it to `destination` with mode 0600.
    ///
    /// # Errors
    /// Returns an error if rendering or writing fails.
    pub fn render_to<S: Serialize>(&self, name: &str, context: S, destination: &Path) -> Result<()> {
        let rendered = self.render(name, context)?;
        fs_util::write_private(destination, rendered)
    }
}

/// Returns the unrendered source of a bundled template.
///
/// # Errors
/// Returns an error if `name` is not bundled.
pub fn raw(name: &str) -> Result<&'static str> {
    BUNDLED
        .iter()
        .find(|(bundled, _)| *bundled == name)
        .map(|(_, source)| *source)
        .ok_or_else(|| anyhow::anyhow!("Unknown template {name}"))
}

#[cfg(test)]
mod tests {
    use minijinja::context;

    use super::*;

    #[test]
    fn test_all_bundled_templates_compile() {
        let registry = TemplateRegistry::global().expect("registry");
        assert_eq!(registry.env.templates().count(), BUNDLED.len());
    }

    #[test]
    fn test_ansible_expressions_pass_through() {
        let registry = TemplateRegistry::global().expect("registry");
        let rendered = registry
            .render(
                "consul/server.j2",
                context! { datacenter => "dc1", join_addresses => vec!["10.0.0.2"] },
            )
            .expect("render");
        assert!(rendered.contains("datacenter = \"dc1\""));
        assert!(rendered.contains("{{ hostvars[inventory_hostname]['private_ip'] }}"));
        assert!(rendered.contains(r#"retry_join = ["10.0.0.2"]"#));
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let registry = TemplateRegistry::global().expect("registry");
        let err = registry
            .render("nomad/web.hcl", context! {})
            .expect_err("strict undefined");
        assert!(err.to_string().contains("nomad/web.hcl"));
    }

    #[test]
    fn test_raw_returns_bundled_source() {
        let source = raw("vault/token-role.json").expect("raw");
        assert!(source.contains("nomad-cluster") || source.contains("allowed_policies"));
        assert!(raw("missing.tpl").is_err());
    }
}
