//! The secrets record shared by every bootstrap phase.
//!
//! The record lives at `<base_dir>/secrets/secrets.yml` and is also handed to
//! Ansible as extra vars, which is why the field names are the upper-case
//! variable names the playbooks reference.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use crate::error::Error;
use crate::fs_util;
use crate::layout::Layout;

const PENDING_SENTINEL: &str = "TBD";
const GOSSIP_KEY_BYTES: usize = 32;

pub const ENV_S3_ENDPOINT: &str = "S3_ENDPOINT";
pub const ENV_S3_ACCESS_KEY: &str = "S3_ACCESS_KEY";
pub const ENV_S3_SECRET_KEY: &str = "S3_SECRET_KEY";

/// An access token that is either still to be issued or already issued.
///
/// On disk a pending token is the literal `TBD`; an empty value reads back as
/// pending as well.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Token {
    #[default]
    Pending,
    Issued(String),
}

impl Token {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn issued(&self) -> Option<&str> {
        match self {
            Self::Pending => None,
            Self::Issued(value) => Some(value),
        }
    }

    /// Value to hand to tools that always expect a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.issued().unwrap_or(PENDING_SENTINEL)
    }

    fn from_stored(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value == PENDING_SENTINEL {
            Self::Pending
        } else {
            Self::Issued(value.to_string())
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Issued(_) => f.write_str("Issued(<redacted>)"),
        }
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self::from_stored(&value)
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.map_or(Self::Pending, |value| Self::from_stored(&value)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSecrets {
    #[serde(default)]
    pub root_token: Token,
    #[serde(default)]
    pub unseal_keys: Vec<String>,
    #[serde(default)]
    pub nomad_root_token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(rename = "CONSUL_GOSSIP_KEY")]
    pub consul_gossip_key: String,
    #[serde(rename = "NOMAD_GOSSIP_KEY")]
    pub nomad_gossip_key: String,
    #[serde(rename = "CONSUL_BOOTSTRAP_TOKEN", default)]
    pub consul_bootstrap_token: Token,
    #[serde(rename = "CONSUL_AGENT_TOKEN", default)]
    pub consul_agent_token: Token,
    #[serde(rename = "NOMAD_CLIENT_CONSUL_TOKEN", default)]
    pub nomad_client_consul_token: Token,
    #[serde(rename = "NOMAD_SERVER_CONSUL_TOKEN", default)]
    pub nomad_server_consul_token: Token,
    #[serde(rename = "PROMETHEUS_CONSUL_TOKEN", default)]
    pub prometheus_consul_token: Token,
    #[serde(rename = "FABIO_CONSUL_TOKEN", default)]
    pub fabio_consul_token: Token,
    #[serde(rename = "VAULT_CONSUL_TOKEN", default)]
    pub vault_consul_token: Token,
    pub s3_endpoint: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    #[serde(default)]
    pub vault: VaultSecrets,
}

impl Secrets {
    /// A fresh record: both gossip keys set, every token pending.
    #[must_use]
    pub fn new(
        consul_gossip_key: String,
        nomad_gossip_key: String,
        object_storage: ObjectStorageCredentials,
    ) -> Self {
        Self {
            consul_gossip_key,
            nomad_gossip_key,
            consul_bootstrap_token: Token::Pending,
            consul_agent_token: Token::Pending,
            nomad_client_consul_token: Token::Pending,
            nomad_server_consul_token: Token::Pending,
            prometheus_consul_token: Token::Pending,
            fabio_consul_token: Token::Pending,
            vault_consul_token: Token::Pending,
            s3_endpoint: object_storage.endpoint,
            s3_access_key: object_storage.access_key,
            s3_secret_key: object_storage.secret_key,
            vault: VaultSecrets::default(),
        }
    }

    /// Named token fields, in the order they are reported to the operator.
    #[must_use]
    pub fn token_fields(&self) -> Vec<(&'static str, &Token)> {
        vec![
            ("CONSUL_BOOTSTRAP_TOKEN", &self.consul_bootstrap_token),
            ("CONSUL_AGENT_TOKEN", &self.consul_agent_token),
            ("NOMAD_CLIENT_CONSUL_TOKEN", &self.nomad_client_consul_token),
            ("NOMAD_SERVER_CONSUL_TOKEN", &self.nomad_server_consul_token),
            ("PROMETHEUS_CONSUL_TOKEN", &self.prometheus_consul_token),
            ("FABIO_CONSUL_TOKEN", &self.fabio_consul_token),
            ("VAULT_CONSUL_TOKEN", &self.vault_consul_token),
            ("vault.root_token", &self.vault.root_token),
            ("vault.nomad_root_token", &self.vault.nomad_root_token),
        ]
    }
}

/// Object-storage credentials supplied by the operator's environment.
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectStorageCredentials {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for ObjectStorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageCredentials")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ObjectStorageCredentials {
    /// Reads the credentials from the process environment.
    ///
    /// # Errors
    /// Returns [`Error::MissingEnv`] naming every unset or empty variable.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the credentials through `lookup`.
    ///
    /// # Errors
    /// Returns [`Error::MissingEnv`] naming every unset or empty variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut missing = Vec::new();
        let mut read = |key: &str| match lookup(key) {
            Some(value) if !value.trim().is_empty() => value,
            _ => {
                missing.push(key.to_string());
                String::new()
            }
        };
        let endpoint = read(ENV_S3_ENDPOINT);
        let secret_key = read(ENV_S3_SECRET_KEY);
        let access_key = read(ENV_S3_ACCESS_KEY);
        if !missing.is_empty() {
            return Err(Error::MissingEnv(missing));
        }
        Ok(Self {
            endpoint,
            access_key,
            secret_key,
        })
    }
}

/// Generates a 32-byte gossip encryption key, base64 encoded.
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn generate_gossip_key() -> Result<String> {
    let mut buffer = [0u8; GOSSIP_KEY_BYTES];
    SystemRandom::new()
        .fill(&mut buffer)
        .map_err(|_| anyhow::anyhow!("Failed to generate gossip key"))?;
    Ok(STANDARD.encode(buffer))
}

#[must_use]
pub fn exists(base_dir: &Path) -> bool {
    Layout::new(base_dir).secrets_file().exists()
}

/// Loads the secrets record from `<base_dir>/secrets/secrets.yml`.
///
/// # Errors
/// Returns an error if the file is missing or cannot be parsed; use [`exists`]
/// to tell the two apart up front.
pub fn load(base_dir: &Path) -> Result<Secrets> {
    let path = Layout::new(base_dir).secrets_file();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Persists the whole record, replacing the previous file.
///
/// # Errors
/// Returns an error if the record cannot be serialized or written.
pub fn write(base_dir: &Path, secrets: &Secrets) -> Result<()> {
    let layout = Layout::new(base_dir);
    fs_util::ensure_secrets_dir(&layout.secrets_dir())?;
    let contents = serde_yaml::to_string(secrets).context("Failed to serialize secrets")?;
    fs_util::write_private(&layout.secrets_file(), contents)
}

/// Returns the existing record, or creates one with fresh gossip keys and
/// object-storage credentials read through `lookup`.
///
/// # Errors
/// Returns an error if credentials are missing on first creation, or if the
/// record cannot be read or written.
pub fn ensure(base_dir: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Secrets> {
    if exists(base_dir) {
        return load(base_dir);
    }
    let object_storage = ObjectStorageCredentials::from_lookup(lookup)?;
    let secrets = Secrets::new(generate_gossip_key()?, generate_gossip_key()?, object_storage);
    write(base_dir, &secrets)?;
    info!(path = %Layout::new(base_dir).secrets_file().display(), "created secrets record");
    Ok(secrets)
}
