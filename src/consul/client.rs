use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::credentials::{Secrets, Token};
use crate::error::Error;
use crate::fs_util;
use crate::inventory::Inventory;
use crate::layout::Layout;
use crate::runtime::{self, Environment, quote};

pub const CONSUL_HTTPS_PORT: u16 = 8501;
const SECRET_ID_PREFIX: &str = "SecretID:";

/// Operations the bootstrapper and the observability setup need from Consul.
pub trait ConsulApi {
    /// Runs the one-time ACL bootstrap and returns the root token.
    ///
    /// # Errors
    /// Returns an error if the bootstrap call fails or its output has no token.
    fn bootstrap(&mut self) -> Result<String>;

    /// # Errors
    /// Returns an error if the policy cannot be created.
    fn register_policy(&self, name: &str, rules: &Path) -> Result<()>;

    /// # Errors
    /// Returns an error if the policy cannot be updated.
    fn update_policy(&self, name: &str, rules: &Path) -> Result<()>;

    /// Creates a token bound to `policy` and returns its secret id.
    ///
    /// # Errors
    /// Returns an error if the token cannot be created or its output has no secret id.
    fn create_token(&self, description: &str, policy: &str) -> Result<String>;

    /// # Errors
    /// Returns an error if the token cannot be updated.
    fn update_token(&self, id: &str, policy: &str) -> Result<()>;

    /// # Errors
    /// Returns an error if the service definition is rejected.
    fn register_service(&self, definition: &Path) -> Result<()>;

    /// # Errors
    /// Returns an error if the config entry is rejected.
    fn write_config_entry(&self, definition: &Path) -> Result<()>;
}

/// Drives the `consul` binary against the first Consul server.
///
/// Address, token and TLS settings travel as `CONSUL_*` variables of each
/// child process.
#[derive(Debug, Clone)]
pub struct ConsulCli {
    address: String,
    token: Token,
    client_cert: PathBuf,
    client_key: PathBuf,
    transcript: PathBuf,
}

impl ConsulCli {
    /// Builds a client from the current inventory and secrets snapshot.
    ///
    /// # Errors
    /// Returns [`Error::EmptyGroup`] when the inventory has no Consul servers.
    pub fn new(layout: &Layout, inventory: &Inventory, secrets: &Secrets) -> Result<Self, Error> {
        let host = inventory.groups().consul_servers.first_host("consul_servers")?;
        Ok(Self {
            address: format!("{host}:{CONSUL_HTTPS_PORT}"),
            token: secrets.consul_bootstrap_token.clone(),
            client_cert: layout.consul_client_cert(),
            client_key: layout.consul_client_key(),
            transcript: layout.consul_bootstrap_transcript(),
        })
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Token from an earlier `consul acl bootstrap` run, if its transcript was kept.
    ///
    /// A transcript that exists but cannot be read or parsed is an error.
    fn saved_bootstrap_token(&self) -> Result<Option<String>> {
        let contents = match std::fs::read_to_string(&self.transcript) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read {}", self.transcript.display())
                });
            }
        };
        let token = parse_secret_id(&contents, "consul bootstrap transcript")
            .with_context(|| format!("Unusable bootstrap transcript {}", self.transcript.display()))?;
        Ok(Some(token))
    }
}

impl Environment for ConsulCli {
    fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::from([
            ("CONSUL_HTTP_ADDR".to_string(), self.address.clone()),
            (
                "CONSUL_CLIENT_CERT".to_string(),
                self.client_cert.display().to_string(),
            ),
            (
                "CONSUL_CLIENT_KEY".to_string(),
                self.client_key.display().to_string(),
            ),
            ("CONSUL_HTTP_SSL".to_string(), "true".to_string()),
            ("CONSUL_HTTP_SSL_VERIFY".to_string(), "false".to_string()),
        ]);
        if let Some(token) = self.token.issued() {
            vars.insert("CONSUL_HTTP_TOKEN".to_string(), token.to_string());
        }
        vars
    }
}

impl ConsulApi for ConsulCli {
    fn bootstrap(&mut self) -> Result<String> {
        let token = if let Some(token) = self.saved_bootstrap_token()? {
            info!(path = %self.transcript.display(), "reusing saved consul bootstrap transcript");
            token
        } else {
            let transcript = runtime::exec_output(self, "consul acl bootstrap")?;
            if let Some(dir) = self.transcript.parent() {
                fs_util::ensure_secrets_dir(dir)?;
            }
            fs_util::write_private(&self.transcript, &transcript)?;
            parse_secret_id(&transcript, "consul bootstrap transcript")?
        };
        self.token = Token::Issued(token.clone());
        Ok(token)
    }

    fn register_policy(&self, name: &str, rules: &Path) -> Result<()> {
        runtime::exec(
            self,
            &format!(
                "consul acl policy create -name {} -rules @{}",
                quote(name),
                quote(&rules.to_string_lossy())
            ),
        )
        .with_context(|| format!("Failed to register consul policy {name}"))
    }

    fn update_policy(&self, name: &str, rules: &Path) -> Result<()> {
        runtime::exec(
            self,
            &format!(
                "consul acl policy update -name {} -rules @{}",
                quote(name),
                quote(&rules.to_string_lossy())
            ),
        )
        .with_context(|| format!("Failed to update consul policy {name}"))
    }

    fn create_token(&self, description: &str, policy: &str) -> Result<String> {
        let output = runtime::exec_output(
            self,
            &format!(
                "consul acl token create -description {} -policy-name {}",
                quote(description),
                quote(policy)
            ),
        )?;
        Ok(parse_secret_id(&output, &format!("{policy} token"))?)
    }

    fn update_token(&self, id: &str, policy: &str) -> Result<()> {
        runtime::exec(
            self,
            &format!(
                "consul acl token update -id {} -policy-name={}",
                quote(id),
                quote(policy)
            ),
        )
    }

    fn register_service(&self, definition: &Path) -> Result<()> {
        runtime::exec(
            self,
            &format!(
                "consul services register {}",
                quote(&definition.to_string_lossy())
            ),
        )
    }

    fn write_config_entry(&self, definition: &Path) -> Result<()> {
        runtime::exec(
            self,
            &format!("consul config write {}", quote(&definition.to_string_lossy())),
        )
    }
}

/// Extracts the value of the `SecretID:` line from `consul acl` output.
///
/// # Errors
/// Returns [`Error::Parse`] naming `artifact` when no such line carries a value.
pub fn parse_secret_id(output: &str, artifact: &str) -> Result<String, Error> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(SECRET_ID_PREFIX))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::parse(artifact, "no SecretID line"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;
    use crate::credentials::ObjectStorageCredentials;
    use crate::inventory::{Host, HostGroup};

    const BOOTSTRAP_OUTPUT: &str = "\
AccessorID:       b5b4c2b8-0c70-4b52-8f0d-1f4b3b5d7a10
SecretID:         6a1c5b2e-3e4f-4a5b-9c8d-7e6f5a4b3c2d
Description:      Bootstrap Token (Global Management)
Local:            false
Create Time:      2024-01-01 00:00:00 +0000 UTC
Policies:
   00000000-0000-0000-0000-000000000001 - global-management
";

    fn inventory() -> Inventory {
        let mut inventory = Inventory::default();
        inventory.all.children.consul_servers = HostGroup {
            hosts: BTreeMap::from([
                (
                    "5.6.7.8".to_string(),
                    Host {
                        private_ip: "10.0.0.3".to_string(),
                        ..Host::default()
                    },
                ),
                (
                    "1.2.3.4".to_string(),
                    Host {
                        private_ip: "10.0.0.2".to_string(),
                        ..Host::default()
                    },
                ),
            ]),
        };
        inventory
    }

    fn secrets() -> Secrets {
        Secrets::new(
            "a".to_string(),
            "b".to_string(),
            ObjectStorageCredentials {
                endpoint: "e".to_string(),
                access_key: "a".to_string(),
                secret_key: "s".to_string(),
            },
        )
    }

    #[test]
    fn test_parse_secret_id_reads_bootstrap_output() {
        let token = parse_secret_id(BOOTSTRAP_OUTPUT, "bootstrap").expect("parse");
        assert_eq!(token, "6a1c5b2e-3e4f-4a5b-9c8d-7e6f5a4b3c2d");
    }

    #[test]
    fn test_parse_secret_id_without_line_is_parse_error() {
        let err = parse_secret_id("AccessorID: x\n", "agent token").expect_err("missing");
        assert!(matches!(err, Error::Parse { ref artifact, .. } if artifact == "agent token"));
    }

    #[test]
    fn test_variables_target_first_consul_host_and_carry_token_when_issued() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = secrets();

        let pending = ConsulCli::new(&layout, &inventory(), &secrets).expect("client");
        let vars = pending.variables();
        assert_eq!(vars["CONSUL_HTTP_ADDR"], "1.2.3.4:8501");
        assert_eq!(vars["CONSUL_HTTP_SSL"], "true");
        assert_eq!(vars["CONSUL_HTTP_SSL_VERIFY"], "false");
        assert_eq!(
            vars["CONSUL_CLIENT_CERT"],
            layout.consul_client_cert().display().to_string()
        );
        assert!(!vars.contains_key("CONSUL_HTTP_TOKEN"));

        secrets.consul_bootstrap_token = Token::Issued("root".to_string());
        let issued = ConsulCli::new(&layout, &inventory(), &secrets).expect("client");
        assert_eq!(issued.variables()["CONSUL_HTTP_TOKEN"], "root");
    }

    #[test]
    fn test_bootstrap_reuses_saved_transcript() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        fs_util::ensure_secrets_dir(&layout.secrets_dir()).expect("secrets dir");
        std::fs::write(layout.consul_bootstrap_transcript(), BOOTSTRAP_OUTPUT).expect("write");

        let mut consul = ConsulCli::new(&layout, &inventory(), &secrets()).expect("client");
        let token = consul.bootstrap().expect("bootstrap");

        assert_eq!(token, "6a1c5b2e-3e4f-4a5b-9c8d-7e6f5a4b3c2d");
        assert_eq!(
            consul.variables()["CONSUL_HTTP_TOKEN"],
            "6a1c5b2e-3e4f-4a5b-9c8d-7e6f5a4b3c2d"
        );
    }

    #[test]
    fn test_bootstrap_rejects_unparseable_transcript() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        fs_util::ensure_secrets_dir(&layout.secrets_dir()).expect("secrets dir");
        std::fs::write(layout.consul_bootstrap_transcript(), "ACL bootstrap failed\n")
            .expect("write");

        let mut consul = ConsulCli::new(&layout, &inventory(), &secrets()).expect("client");
        let err = consul.bootstrap().expect_err("garbled transcript");

        assert!(err.to_string().contains("Unusable bootstrap transcript"));
        assert!(
            err.chain()
                .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::Parse { .. })))
        );
        assert!(!consul.variables().contains_key("CONSUL_HTTP_TOKEN"));
    }

    #[test]
    fn test_bootstrap_transcript_read_error_is_propagated() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.consul_bootstrap_transcript()).expect("dir in place");

        let mut consul = ConsulCli::new(&layout, &inventory(), &secrets()).expect("client");
        let err = consul.bootstrap().expect_err("unreadable transcript");

        assert!(err.to_string().starts_with("Failed to read"));
    }

    #[test]
    fn test_new_without_consul_servers_is_empty_group() {
        let dir = tempdir().expect("tempdir");
        let err = ConsulCli::new(&Layout::new(dir.path()), &Inventory::default(), &secrets())
            .expect_err("no servers");
        assert!(matches!(err, Error::EmptyGroup("consul_servers")));
    }
}
