//! Vault lifecycle: `Uninitialized -> InitializedSealed -> Unsealed ->
//! NomadTokenProvisioned`.
//!
//! Initialization is detected by the transcript file under
//! `secrets/vault/init.txt`, never by asking Vault. An exclusive marker is
//! held while the one-time init call is in flight, so a crash between the
//! call and persisting its output is reported instead of retried. The marker
//! is released on failure only when Vault provably did not act on the call:
//! the connection was never made, or Vault answered with a 4xx status.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use super::client::{TokenRequest, VaultApi};
use crate::config::Settings;
use crate::credentials::{self, Secrets, Token, VaultSecrets};
use crate::error::Error;
use crate::fs_util;
use crate::layout::Layout;
use crate::templates;

pub const UNSEAL_SHARES: u8 = 5;
pub const UNSEAL_THRESHOLD: u8 = 3;

const SCHEDULER_POLICY: &str = "nomad-server";
const SCHEDULER_ROLE: &str = "nomad-cluster";
const POLICY_TEMPLATE: &str = "vault/nomad-server-policy.hcl";
const TOKEN_ROLE_TEMPLATE: &str = "vault/token-role.json";
const TRANSCRIPT_ARTIFACT: &str = "vault init transcript";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultInitResult {
    /// This run performed the one-time initialization.
    Initialized,
    /// Vault was already initialized; hosts were unsealed as needed.
    Unsealed,
}

/// Unseal material captured from the one-time initialization.
#[derive(Clone, PartialEq, Eq)]
pub struct InitTranscript {
    pub unseal_keys: Vec<String>,
    pub root_token: String,
}

impl std::fmt::Debug for InitTranscript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitTranscript")
            .field("unseal_keys", &self.unseal_keys.len())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct InitResponse {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    keys_base64: Vec<String>,
    root_token: String,
}

/// Parses an init transcript: the JSON body of `sys/init`, or the text that
/// `vault operator init` prints (`Unseal Key N: ...`, `Initial Root Token: ...`).
///
/// # Errors
/// Returns [`Error::Parse`] if no unseal key or no root token can be found.
pub fn parse_init_transcript(text: &str) -> Result<InitTranscript, Error> {
    let transcript = if text.trim_start().starts_with('{') {
        let response: InitResponse = serde_json::from_str(text)
            .map_err(|err| Error::parse(TRANSCRIPT_ARTIFACT, err.to_string()))?;
        let unseal_keys = if response.keys_base64.is_empty() {
            response.keys
        } else {
            response.keys_base64
        };
        InitTranscript {
            unseal_keys,
            root_token: response.root_token,
        }
    } else {
        let mut unseal_keys = Vec::new();
        let mut root_token = String::new();
        for line in text.lines().map(str::trim) {
            if line.starts_with("Unseal Key")
                && let Some((_, key)) = line.split_once(": ")
            {
                unseal_keys.push(key.trim().to_string());
            } else if let Some(token) = line.strip_prefix("Initial Root Token:") {
                root_token = token.trim().to_string();
            }
        }
        InitTranscript {
            unseal_keys,
            root_token,
        }
    };
    if transcript.unseal_keys.is_empty() {
        return Err(Error::parse(TRANSCRIPT_ARTIFACT, "no unseal keys"));
    }
    if transcript.root_token.trim().is_empty() {
        return Err(Error::parse(TRANSCRIPT_ARTIFACT, "no root token"));
    }
    Ok(transcript)
}

fn read_transcript(layout: &Layout) -> Result<InitTranscript> {
    let path = layout.vault_init_transcript();
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(parse_init_transcript(&text)?)
}

fn store_transcript(secrets: &mut Secrets, transcript: InitTranscript) {
    secrets.vault = VaultSecrets {
        root_token: Token::Issued(transcript.root_token),
        unseal_keys: transcript.unseal_keys,
        nomad_root_token: secrets.vault.nomad_root_token.clone(),
    };
}

fn write_role_files(layout: &Layout) -> Result<()> {
    fs_util::ensure_artifact_dir(&layout.role_dir("vault"))?;
    for name in [POLICY_TEMPLATE, TOKEN_ROLE_TEMPLATE] {
        fs_util::write_private(&layout.base_dir().join(name), templates::raw(name)?)?;
    }
    Ok(())
}

/// Submits every share to each host that reports itself sealed.
async fn unseal_all<V: VaultApi>(nodes: &[V], keys: &[String]) -> Result<()> {
    for node in nodes {
        let status = node
            .seal_status()
            .await
            .with_context(|| format!("Failed to read seal status of {}", node.address()))?;
        if !status.sealed {
            continue;
        }
        info!(address = node.address(), "unsealing vault");
        for key in keys {
            node.unseal(key)
                .await
                .with_context(|| format!("Failed to unseal {}", node.address()))?;
        }
    }
    Ok(())
}

async fn initialize<V: VaultApi>(
    nodes: &mut [V],
    secrets: &mut Secrets,
    layout: &Layout,
    kv_mount: &str,
) -> Result<()> {
    let marker = layout.vault_init_marker();
    fs_util::ensure_secrets_dir(&layout.vault_secrets_dir())?;
    if !fs_util::create_marker(&marker)? {
        return Err(Error::InterruptedInit(marker).into());
    }
    let first = &mut nodes[0];
    info!(address = first.address(), "initializing vault");
    let text = match first.init(UNSEAL_SHARES, UNSEAL_THRESHOLD).await {
        Ok(text) => text,
        Err(err) if init_was_rejected(&err) => {
            fs_util::remove_marker(&marker)?;
            return Err(err.context("Vault initialization failed"));
        }
        Err(err) => {
            warn!(path = %marker.display(), "vault init outcome unknown, keeping marker");
            return Err(err.context(format!(
                "Vault initialization outcome unknown; {} was kept. If Vault reports itself \
                 initialized, recover the unseal keys and root token into {} before rerunning",
                marker.display(),
                layout.vault_init_transcript().display()
            )));
        }
    };
    fs_util::write_private(&layout.vault_init_transcript(), &text)?;
    fs_util::remove_marker(&marker)?;

    store_transcript(secrets, parse_init_transcript(&text)?);
    credentials::write(layout.base_dir(), secrets)?;

    let root = secrets.vault.root_token.as_str().to_string();
    first.set_token(root);
    unseal_all(nodes, &secrets.vault.unseal_keys).await?;
    nodes[0]
        .enable_kv_v2(kv_mount)
        .await
        .with_context(|| format!("Failed to enable kv-v2 at {kv_mount}"))?;
    Ok(())
}

/// Whether a failed init call left Vault untouched.
fn init_was_rejected(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let rejected = matches!(
            cause.downcast_ref::<Error>(),
            Some(Error::VaultStatus { status, .. }) if (400..500).contains(status)
        );
        let unsent = cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|err| err.is_connect() || err.is_builder());
        rejected || unsent
    })
}

async fn provision_scheduler_token<V: VaultApi>(
    node: &V,
    secrets: &mut Secrets,
    layout: &Layout,
    settings: &Settings,
) -> Result<()> {
    node.write_policy(SCHEDULER_POLICY, templates::raw(POLICY_TEMPLATE)?)
        .await?;
    let request = TokenRequest {
        policies: vec![SCHEDULER_POLICY.to_string()],
        period: format!("{}s", settings.vault_token_period()?.as_secs()),
        renewable: true,
    };
    let token = node.create_orphan_token(&request).await?;
    secrets.vault.nomad_root_token = Token::Issued(token);

    let role: serde_json::Value = serde_json::from_str(templates::raw(TOKEN_ROLE_TEMPLATE)?)
        .context("Failed to parse bundled token role")?;
    node.write_token_role(SCHEDULER_ROLE, &role).await?;
    credentials::write(layout.base_dir(), secrets)?;
    info!(period = %request.period, "provisioned nomad vault token");
    Ok(())
}

/// Brings every Vault host to the unsealed state and refreshes the
/// scheduler's token.
///
/// `nodes` holds one client per Vault host; the first one receives the
/// one-time init call and every authenticated request.
///
/// # Errors
/// Returns [`Error::InterruptedInit`] when a previous init was cut short,
/// [`Error::Parse`] for an unreadable transcript, and any Vault or I/O failure.
pub async fn initialize_vault<V: VaultApi>(
    nodes: &mut [V],
    secrets: &mut Secrets,
    layout: &Layout,
    settings: &Settings,
) -> Result<VaultInitResult> {
    write_role_files(layout)?;
    if nodes.is_empty() {
        return Err(Error::EmptyGroup("vault_servers").into());
    }

    let result = if layout.vault_init_transcript().exists() {
        let marker = layout.vault_init_marker();
        if marker.exists() {
            warn!(path = %marker.display(), "removing stale vault init marker");
            fs_util::remove_marker(&marker)?;
        }
        if secrets.vault.root_token.is_pending() {
            store_transcript(secrets, read_transcript(layout)?);
            credentials::write(layout.base_dir(), secrets)?;
        }
        VaultInitResult::Unsealed
    } else {
        initialize(nodes, secrets, layout, &settings.bootstrap.kv_mount).await?;
        VaultInitResult::Initialized
    };

    nodes[0].set_token(secrets.vault.root_token.as_str().to_string());
    unseal_all(nodes, &secrets.vault.unseal_keys).await?;
    provision_scheduler_token(&nodes[0], secrets, layout, settings).await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tempfile::tempdir;

    use super::*;
    use crate::config::tests::sample_settings;
    use crate::credentials::ObjectStorageCredentials;
    use crate::vault::client::SealStatus;

    const ROOT_TOKEN: &str = "hvs.tswBMw2mcJv9cLkQ7cfsxDZg";
    const KEYS: [&str; 5] = [
        "4IwfRgraGxXvnBKTkW6hMt5S+pPWFnKG9WXYQJBCbDV4",
        "rLlg7MZnchlpz3NxRWMjj0joiH7qs++hLxHGefyQ4Rm7",
        "+ZzoQ4KYENet1D+qRZMmXuCCUmdKOjbCybjWeSM7PQtg",
        "qfaVNHwa1L1IllpYS8OY9xqQyhYbNGlHZ6pyOL2fBCtW",
        "ew4QyHy+YNGxWWjNIiN5RzfZ8+k92goN5D9+MmKX8y9k",
    ];

    fn text_transcript() -> String {
        let mut text = String::new();
        for (index, key) in KEYS.iter().enumerate() {
            text.push_str(&format!("Unseal Key {}: {key}\n", index + 1));
        }
        text.push_str(&format!("\nInitial Root Token: {ROOT_TOKEN}\n\nVault initialized with 5 key shares and a key threshold of 3.\n"));
        text
    }

    fn json_transcript() -> String {
        serde_json::json!({
            "keys": ["e08c1f", "acb960", "f99ce8", "a9f695", "7b0e10"],
            "keys_base64": KEYS,
            "root_token": ROOT_TOKEN,
        })
        .to_string()
    }

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum InitFailure {
        Rejected(u16),
        ResponseLost,
    }

    struct StubVault {
        address: String,
        sealed: Mutex<bool>,
        token: Option<String>,
        init_failure: Option<InitFailure>,
        log: Log,
    }

    impl StubVault {
        fn new(address: &str, sealed: bool, log: &Log) -> Self {
            Self {
                address: address.to_string(),
                sealed: Mutex::new(sealed),
                token: None,
                init_failure: None,
                log: Arc::clone(log),
            }
        }

        fn failing_init(address: &str, failure: InitFailure, log: &Log) -> Self {
            Self {
                init_failure: Some(failure),
                ..Self::new(address, true, log)
            }
        }

        fn record(&self, call: String) {
            self.log.lock().expect("log").push(format!("{} {call}", self.address));
        }

        fn authorized(&self) -> Result<()> {
            if self.token.as_deref() != Some(ROOT_TOKEN) {
                anyhow::bail!("permission denied");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl VaultApi for StubVault {
        fn address(&self) -> &str {
            &self.address
        }

        fn set_token(&mut self, token: String) {
            self.token = Some(token);
        }

        async fn init(&self, shares: u8, threshold: u8) -> Result<String> {
            self.record(format!("init {shares}/{threshold}"));
            match self.init_failure {
                None => Ok(json_transcript()),
                Some(InitFailure::Rejected(status)) => Err(Error::VaultStatus {
                    status,
                    body: "{\"errors\":[\"Vault is already initialized\"]}".to_string(),
                })
                .context("Vault request failed"),
                Some(InitFailure::ResponseLost) => {
                    Err(anyhow::anyhow!("error decoding response body: operation timed out"))
                }
            }
        }

        async fn seal_status(&self) -> Result<SealStatus> {
            Ok(SealStatus {
                sealed: *self.sealed.lock().expect("sealed"),
                t: Some(3),
                progress: None,
            })
        }

        async fn unseal(&self, key: &str) -> Result<SealStatus> {
            self.record(format!("unseal {key}"));
            *self.sealed.lock().expect("sealed") = false;
            self.seal_status().await
        }

        async fn enable_kv_v2(&self, mount: &str) -> Result<()> {
            self.authorized()?;
            self.record(format!("kv {mount}"));
            Ok(())
        }

        async fn write_policy(&self, name: &str, policy: &str) -> Result<()> {
            self.authorized()?;
            assert!(policy.contains("auth/token/create/nomad-cluster"));
            self.record(format!("policy {name}"));
            Ok(())
        }

        async fn create_orphan_token(&self, request: &TokenRequest) -> Result<String> {
            self.authorized()?;
            self.record(format!(
                "token {} {} {}",
                request.policies.join(","),
                request.period,
                request.renewable
            ));
            Ok(format!("hvs.nomad-{}", self.log.lock().expect("log").len()))
        }

        async fn write_token_role(&self, name: &str, role: &serde_json::Value) -> Result<()> {
            self.authorized()?;
            assert_eq!(role["token_period"], 259_200);
            self.record(format!("role {name}"));
            Ok(())
        }
    }

    fn fresh_secrets(layout: &Layout) -> Secrets {
        let secrets = Secrets::new(
            "a".to_string(),
            "b".to_string(),
            ObjectStorageCredentials {
                endpoint: "e".to_string(),
                access_key: "a".to_string(),
                secret_key: "s".to_string(),
            },
        );
        credentials::write(layout.base_dir(), &secrets).expect("write secrets");
        secrets
    }

    fn calls(log: &Log, needle: &str) -> Vec<String> {
        log.lock()
            .expect("log")
            .iter()
            .filter(|call| call.contains(needle))
            .cloned()
            .collect()
    }

    #[test]
    fn test_parse_text_transcript() {
        let transcript = parse_init_transcript(&text_transcript()).expect("parse");
        assert_eq!(transcript.root_token, ROOT_TOKEN);
        assert_eq!(transcript.unseal_keys, KEYS);
    }

    #[test]
    fn test_parse_json_transcript_prefers_base64_keys() {
        let transcript = parse_init_transcript(&json_transcript()).expect("parse");
        assert_eq!(transcript.root_token, ROOT_TOKEN);
        assert_eq!(transcript.unseal_keys, KEYS);
    }

    #[test]
    fn test_parse_transcript_without_root_token_is_parse_error() {
        let err = parse_init_transcript("Unseal Key 1: abc\n").expect_err("no root");
        assert!(matches!(err, Error::Parse { ref reason, .. } if reason == "no root token"));
        let err = parse_init_transcript("garbage").expect_err("no keys");
        assert!(matches!(err, Error::Parse { ref reason, .. } if reason == "no unseal keys"));
    }

    #[tokio::test]
    async fn test_first_run_initializes_unseals_and_provisions_token() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = fresh_secrets(&layout);
        let log = Log::default();
        let mut nodes = vec![
            StubVault::new("vault-0", true, &log),
            StubVault::new("vault-1", true, &log),
        ];

        let result = initialize_vault(&mut nodes, &mut secrets, &layout, &sample_settings())
            .await
            .expect("initialize");

        assert_eq!(result, VaultInitResult::Initialized);
        assert_eq!(calls(&log, "init"), vec!["vault-0 init 5/3"]);
        assert_eq!(calls(&log, "vault-0 unseal").len(), 5);
        assert_eq!(calls(&log, "vault-1 unseal").len(), 5);
        assert_eq!(calls(&log, "kv"), vec!["vault-0 kv secret"]);
        assert_eq!(calls(&log, "policy"), vec!["vault-0 policy nomad-server"]);
        assert_eq!(
            calls(&log, "token"),
            vec!["vault-0 token nomad-server 259200s true"]
        );
        assert_eq!(calls(&log, "role"), vec!["vault-0 role nomad-cluster"]);

        assert!(layout.vault_init_transcript().exists());
        assert!(!layout.vault_init_marker().exists());
        assert!(layout.base_dir().join("vault/token-role.json").exists());
        let stored = credentials::load(dir.path()).expect("load");
        assert_eq!(stored.vault.root_token.as_str(), ROOT_TOKEN);
        assert_eq!(stored.vault.unseal_keys, KEYS);
        assert!(!stored.vault.nomad_root_token.is_pending());
        assert_eq!(stored, secrets);
    }

    #[tokio::test]
    async fn test_rerun_unseals_only_sealed_hosts_and_refreshes_token() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = fresh_secrets(&layout);
        let settings = sample_settings();
        let log = Log::default();
        let mut nodes = vec![
            StubVault::new("vault-0", true, &log),
            StubVault::new("vault-1", true, &log),
        ];
        initialize_vault(&mut nodes, &mut secrets, &layout, &settings)
            .await
            .expect("first run");
        let first_token = secrets.vault.nomad_root_token.clone();

        let rerun_log = Log::default();
        let mut nodes = vec![
            StubVault::new("vault-0", false, &rerun_log),
            StubVault::new("vault-1", true, &rerun_log),
        ];
        let mut reloaded = credentials::load(dir.path()).expect("load");
        let result = initialize_vault(&mut nodes, &mut reloaded, &layout, &settings)
            .await
            .expect("second run");

        assert_eq!(result, VaultInitResult::Unsealed);
        assert!(calls(&rerun_log, "init").is_empty());
        assert!(calls(&rerun_log, "kv").is_empty());
        assert!(calls(&rerun_log, "vault-0 unseal").is_empty());
        assert_eq!(calls(&rerun_log, "vault-1 unseal").len(), KEYS.len());
        assert_eq!(calls(&rerun_log, "token").len(), 1);
        assert_ne!(reloaded.vault.nomad_root_token, first_token);
        assert_eq!(reloaded.vault.root_token.as_str(), ROOT_TOKEN);
    }

    #[tokio::test]
    async fn test_pending_root_token_is_recovered_from_text_transcript() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = fresh_secrets(&layout);
        fs_util::ensure_secrets_dir(&layout.vault_secrets_dir()).expect("dir");
        std::fs::write(layout.vault_init_transcript(), text_transcript()).expect("write");
        let log = Log::default();
        let mut nodes = vec![StubVault::new("vault-0", false, &log)];

        let result = initialize_vault(&mut nodes, &mut secrets, &layout, &sample_settings())
            .await
            .expect("initialize");

        assert_eq!(result, VaultInitResult::Unsealed);
        assert!(calls(&log, "init").is_empty());
        let stored = credentials::load(dir.path()).expect("load");
        assert_eq!(stored.vault.root_token.as_str(), ROOT_TOKEN);
        assert_eq!(stored.vault.unseal_keys.len(), 5);
    }

    #[tokio::test]
    async fn test_leftover_marker_without_transcript_is_interrupted_init() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = fresh_secrets(&layout);
        fs_util::ensure_secrets_dir(&layout.vault_secrets_dir()).expect("dir");
        std::fs::write(layout.vault_init_marker(), "").expect("marker");
        let log = Log::default();
        let mut nodes = vec![StubVault::new("vault-0", true, &log)];

        let err = initialize_vault(&mut nodes, &mut secrets, &layout, &sample_settings())
            .await
            .expect_err("interrupted");

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InterruptedInit(path)) if *path == layout.vault_init_marker()
        ));
        assert!(log.lock().expect("log").is_empty());
    }

    #[tokio::test]
    async fn test_init_with_lost_response_keeps_marker() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = fresh_secrets(&layout);
        let settings = sample_settings();
        let log = Log::default();
        let mut nodes = vec![StubVault::failing_init("vault-0", InitFailure::ResponseLost, &log)];

        let err = initialize_vault(&mut nodes, &mut secrets, &layout, &settings)
            .await
            .expect_err("lost response");

        assert!(format!("{err:#}").contains("outcome unknown"));
        assert!(layout.vault_init_marker().exists());
        assert!(!layout.vault_init_transcript().exists());
        assert!(secrets.vault.root_token.is_pending());

        let rerun_log = Log::default();
        let mut nodes = vec![StubVault::new("vault-0", true, &rerun_log)];
        let err = initialize_vault(&mut nodes, &mut secrets, &layout, &settings)
            .await
            .expect_err("marker blocks rerun");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InterruptedInit(_))
        ));
        assert!(calls(&rerun_log, "init").is_empty());
    }

    #[tokio::test]
    async fn test_init_rejected_by_vault_releases_marker() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = fresh_secrets(&layout);
        let log = Log::default();
        let mut nodes = vec![StubVault::failing_init("vault-0", InitFailure::Rejected(400), &log)];

        let err = initialize_vault(&mut nodes, &mut secrets, &layout, &sample_settings())
            .await
            .expect_err("rejected");

        assert!(format!("{err:#}").contains("Vault initialization failed"));
        assert!(!layout.vault_init_marker().exists());
        assert_eq!(calls(&log, "init"), vec!["vault-0 init 5/3"]);
    }

    #[tokio::test]
    async fn test_init_server_error_keeps_marker() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = fresh_secrets(&layout);
        let log = Log::default();
        let mut nodes = vec![StubVault::failing_init("vault-0", InitFailure::Rejected(503), &log)];

        initialize_vault(&mut nodes, &mut secrets, &layout, &sample_settings())
            .await
            .expect_err("server error");

        assert!(layout.vault_init_marker().exists());
    }

    #[tokio::test]
    async fn test_no_vault_hosts_is_empty_group() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let mut secrets = fresh_secrets(&layout);
        let mut nodes: Vec<StubVault> = Vec::new();

        let err = initialize_vault(&mut nodes, &mut secrets, &layout, &sample_settings())
            .await
            .expect_err("no hosts");

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::EmptyGroup("vault_servers"))
        ));
    }
}
