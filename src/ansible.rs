use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::layout::Layout;
use crate::runtime::{self, Environment, quote};

/// Runs one configuration-management playbook against the whole inventory.
pub trait ConfigManagement {
    /// # Errors
    /// Returns an error if the playbook run fails.
    fn run(&self, playbook: &Path) -> Result<()>;
}

/// `ansible-playbook` with the inventory, the secrets record and the
/// operator config as extra vars.
#[derive(Debug, Clone)]
pub struct AnsibleCli {
    inventory: PathBuf,
    secrets: PathBuf,
    user: String,
    config_path: PathBuf,
}

impl AnsibleCli {
    #[must_use]
    pub fn new(layout: &Layout, user: &str, config_path: &Path) -> Self {
        Self {
            inventory: layout.inventory(),
            secrets: layout.secrets_file(),
            user: user.to_string(),
            config_path: config_path.to_path_buf(),
        }
    }

    fn command(&self, playbook: &Path) -> String {
        format!(
            "ansible-playbook {} -i {} -u {} -e @{} -e @{}",
            quote(&playbook.to_string_lossy()),
            quote(&self.inventory.to_string_lossy()),
            quote(&self.user),
            quote(&self.secrets.to_string_lossy()),
            quote(&self.config_path.to_string_lossy()),
        )
    }
}

impl Environment for AnsibleCli {
    fn variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "ANSIBLE_HOST_KEY_CHECKING".to_string(),
            "False".to_string(),
        )])
    }
}

impl ConfigManagement for AnsibleCli {
    fn run(&self, playbook: &Path) -> Result<()> {
        info!(playbook = %playbook.display(), "running playbook");
        runtime::exec(self, &self.command(playbook))
            .with_context(|| format!("Playbook {} failed", playbook.display()))
    }
}
