//! Infrastructure provisioning through Terraform.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use minijinja::context;
use tracing::info;

use crate::config::{SUPPORTED_PROVIDER, Settings};
use crate::error::Error;
use crate::fs_util;
use crate::inventory::ProvisionerOutput;
use crate::layout::Layout;
use crate::runtime::{self, Environment};
use crate::templates::{self, TemplateRegistry};

pub const ENV_HETZNER_TOKEN: &str = "HETZNER_TOKEN";
const TF_VAR_HCLOUD_TOKEN: &str = "TF_VAR_hcloud_token";

/// Creates or updates the machines and reports what exists.
pub trait Provisioner {
    /// Applies the definitions in `terraform/` and returns the parsed outputs.
    ///
    /// # Errors
    /// Returns an error if any provisioning step fails or the output cannot be parsed.
    fn apply(&self, layout: &Layout) -> Result<ProvisionerOutput>;
}

/// Writes `terraform/vars.tf` and `terraform/main.tf` for the configured provider.
///
/// # Errors
/// Returns [`Error::UnsupportedProvider`] for an unknown provider, or an error
/// if rendering or writing fails.
pub fn render_definitions(
    settings: &Settings,
    layout: &Layout,
    https_allowed_ips: &[String],
) -> Result<()> {
    let provider = &settings.cloud_provider_config.provider;
    if provider != SUPPORTED_PROVIDER {
        return Err(Error::UnsupportedProvider(provider.clone()).into());
    }
    let dir = layout.terraform_dir();
    fs_util::ensure_artifact_dir(&dir)?;
    TemplateRegistry::global()?.render_to(
        &format!("terraform/{provider}/vars.tf"),
        context! {
            provider => &settings.cloud_provider_config.provider_settings,
            cluster => &settings.cluster_config,
            https_allowed_ips => https_allowed_ips,
            observability_hosts => settings.observability_hosts(),
        },
        &dir.join("vars.tf"),
    )?;
    fs_util::write_private(
        &dir.join("main.tf"),
        templates::raw(&format!("terraform/{provider}/main.tf"))?,
    )?;
    Ok(())
}

/// The `terraform` binary, run inside `terraform/`.
#[derive(Clone)]
pub struct TerraformCli {
    dir: PathBuf,
    api_token: Option<String>,
}

impl std::fmt::Debug for TerraformCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerraformCli")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl TerraformCli {
    #[must_use]
    pub fn new(layout: &Layout, api_token: Option<String>) -> Self {
        Self {
            dir: layout.terraform_dir(),
            api_token,
        }
    }

    /// Reads the provider API token from `HETZNER_TOKEN`.
    #[must_use]
    pub fn from_env(layout: &Layout) -> Self {
        Self::new(layout, std::env::var(ENV_HETZNER_TOKEN).ok())
    }
}

impl Environment for TerraformCli {
    fn variables(&self) -> BTreeMap<String, String> {
        self.api_token
            .iter()
            .map(|token| (TF_VAR_HCLOUD_TOKEN.to_string(), token.clone()))
            .collect()
    }

    fn working_directory(&self) -> Option<&std::path::Path> {
        Some(&self.dir)
    }
}

impl Provisioner for TerraformCli {
    fn apply(&self, layout: &Layout) -> Result<ProvisionerOutput> {
        runtime::exec(self, "terraform init -upgrade")?;
        runtime::exec(self, "terraform apply -auto-approve")?;
        let output = runtime::exec_output(self, "terraform output -json")?;
        let path = layout.provisioner_output();
        fs_util::write_private(&path, &output)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        info!(path = %path.display(), "saved provisioner output");
        ProvisionerOutput::parse(&output)
    }
}
