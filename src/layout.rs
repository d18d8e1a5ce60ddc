use std::path::{Path, PathBuf};

const SECRETS_DIR: &str = "secrets";
const SECRETS_FILE: &str = "secrets.yml";
const INVENTORY_FILE: &str = "inventory";
const PROVISIONER_OUTPUT_FILE: &str = "inventory-output.json";
const CONSUL_BOOTSTRAP_TRANSCRIPT: &str = "consul-bootstrap.token";
const HTPASSWD_FILE: &str = "consul.htpasswd";
const VAULT_INIT_TRANSCRIPT: &str = "init.txt";
const VAULT_INIT_MARKER: &str = "init.lock";

/// Directory layout of everything a bootstrap run reads and writes under
/// the configured base directory.
#[derive(Debug, Clone)]
pub struct Layout {
    base_dir: PathBuf,
}

impl Layout {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn inventory(&self) -> PathBuf {
        self.base_dir.join(INVENTORY_FILE)
    }

    #[must_use]
    pub fn provisioner_output(&self) -> PathBuf {
        self.base_dir.join(PROVISIONER_OUTPUT_FILE)
    }

    #[must_use]
    pub fn terraform_dir(&self) -> PathBuf {
        self.base_dir.join("terraform")
    }

    /// Playbooks live directly under the base directory, e.g. `consul.yml`.
    #[must_use]
    pub fn playbook(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.yml"))
    }

    /// Rendered per-role artifacts such as `consul/server.j2`.
    #[must_use]
    pub fn role_dir(&self, role: &str) -> PathBuf {
        self.base_dir.join(role)
    }

    #[must_use]
    pub fn secrets_dir(&self) -> PathBuf {
        self.base_dir.join(SECRETS_DIR)
    }

    #[must_use]
    pub fn secrets_file(&self) -> PathBuf {
        self.secrets_dir().join(SECRETS_FILE)
    }

    #[must_use]
    pub fn consul_secrets_dir(&self) -> PathBuf {
        self.secrets_dir().join("consul")
    }

    #[must_use]
    pub fn nomad_secrets_dir(&self) -> PathBuf {
        self.secrets_dir().join("nomad")
    }

    #[must_use]
    pub fn vault_secrets_dir(&self) -> PathBuf {
        self.secrets_dir().join("vault")
    }

    #[must_use]
    pub fn consul_client_cert(&self) -> PathBuf {
        self.consul_secrets_dir().join("consul-agent-ca.pem")
    }

    #[must_use]
    pub fn consul_client_key(&self) -> PathBuf {
        self.consul_secrets_dir().join("consul-agent-ca-key.pem")
    }

    #[must_use]
    pub fn consul_bootstrap_transcript(&self) -> PathBuf {
        self.secrets_dir().join(CONSUL_BOOTSTRAP_TRANSCRIPT)
    }

    #[must_use]
    pub fn consul_policy(&self, file_stem: &str) -> PathBuf {
        self.role_dir("consul").join(format!("{file_stem}.hcl"))
    }

    #[must_use]
    pub fn htpasswd_file(&self) -> PathBuf {
        self.secrets_dir().join(HTPASSWD_FILE)
    }

    #[must_use]
    pub fn nomad_ca_cert(&self) -> PathBuf {
        self.nomad_secrets_dir().join("nomad-ca.pem")
    }

    #[must_use]
    pub fn nomad_client_cert(&self) -> PathBuf {
        self.nomad_secrets_dir().join("client.pem")
    }

    #[must_use]
    pub fn nomad_client_key(&self) -> PathBuf {
        self.nomad_secrets_dir().join("client-key.pem")
    }

    #[must_use]
    pub fn nomad_server_cert(&self) -> PathBuf {
        self.nomad_secrets_dir().join("server.pem")
    }

    #[must_use]
    pub fn nomad_cli_cert(&self) -> PathBuf {
        self.nomad_secrets_dir().join("cli.pem")
    }

    #[must_use]
    pub fn vault_tls_cert(&self) -> PathBuf {
        self.vault_secrets_dir().join("tls.crt")
    }

    #[must_use]
    pub fn vault_tls_key(&self) -> PathBuf {
        self.vault_secrets_dir().join("tls.key")
    }

    #[must_use]
    pub fn vault_init_transcript(&self) -> PathBuf {
        self.vault_secrets_dir().join(VAULT_INIT_TRANSCRIPT)
    }

    #[must_use]
    pub fn vault_init_marker(&self) -> PathBuf {
        self.vault_secrets_dir().join(VAULT_INIT_MARKER)
    }

    #[must_use]
    pub fn canary_job(&self) -> PathBuf {
        self.role_dir("nomad").join("web.hcl")
    }
}
