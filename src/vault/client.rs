use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";
pub const VAULT_PORT: u16 = 8200;

/// One Vault server, as seen by the initializer.
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Base URL of the server, for logs and errors.
    fn address(&self) -> &str;

    /// Token sent with every authenticated call.
    fn set_token(&mut self, token: String);

    /// Initializes the server and returns the raw response body.
    ///
    /// # Errors
    /// Returns an error if the request fails or Vault rejects it.
    async fn init(&self, shares: u8, threshold: u8) -> Result<String>;

    /// # Errors
    /// Returns an error if the server is unreachable or answers with an error.
    async fn seal_status(&self) -> Result<SealStatus>;

    /// # Errors
    /// Returns an error if the key is rejected or the server is unreachable.
    async fn unseal(&self, key: &str) -> Result<SealStatus>;

    /// Mounts a KV v2 engine at `mount` unless it is already there.
    ///
    /// # Errors
    /// Returns an error if `mount` holds a different engine or the call fails.
    async fn enable_kv_v2(&self, mount: &str) -> Result<()>;

    /// # Errors
    /// Returns an error if the policy cannot be written.
    async fn write_policy(&self, name: &str, policy: &str) -> Result<()>;

    /// Creates an orphan token and returns its client token.
    ///
    /// # Errors
    /// Returns an error if the token cannot be created.
    async fn create_orphan_token(&self, request: &TokenRequest) -> Result<String>;

    /// # Errors
    /// Returns an error if the role cannot be written.
    async fn write_token_role(&self, name: &str, role: &serde_json::Value) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SealStatus {
    pub sealed: bool,
    #[serde(default)]
    pub t: Option<u32>,
    #[serde(default)]
    pub progress: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TokenRequest {
    pub policies: Vec<String>,
    pub period: String,
    pub renewable: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    auth: TokenAuth,
}

#[derive(Debug, Deserialize)]
struct TokenAuth {
    client_token: String,
}

#[derive(Debug, Deserialize)]
struct MountResponse {
    data: MountData,
}

#[derive(Debug, Deserialize)]
struct MountData {
    #[serde(rename = "type")]
    mount_type: String,
    #[serde(default)]
    options: Option<MountOptions>,
}

#[derive(Debug, Deserialize)]
struct MountOptions {
    #[serde(default)]
    version: Option<String>,
}

/// Vault HTTP API client for a single server.
///
/// Listener certificates are self-signed, so certificate verification is off.
#[derive(Debug, Clone)]
pub struct VaultClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl VaultClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build Vault HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: None,
        })
    }

    /// Client for the Vault listener on `host`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn for_host(host: &str) -> Result<Self> {
        Self::new(&format!("https://{host}:{VAULT_PORT}"))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Vault token is not set"))
    }

    async fn get_mount(&self, mount: &str) -> Result<Option<MountData>> {
        let response = self
            .client
            .get(self.endpoint(&format!("sys/mounts/{mount}")))
            .header(VAULT_TOKEN_HEADER, self.token()?)
            .send()
            .await
            .context("Failed to query Vault mounts")?;
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read Vault mount response")?;
        if status == StatusCode::NOT_FOUND
            || (status == StatusCode::BAD_REQUEST && text.contains("No secret engine mount"))
        {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, text).into());
        }
        let parsed: MountResponse =
            serde_json::from_str(&text).context("Failed to parse mount response")?;
        Ok(Some(parsed.data))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.endpoint(path))
            .send()
            .await
            .with_context(|| format!("Vault request failed: {}/{path}", self.base_url))?;
        let text = Self::response_text(response).await?;
        parse_body(&text).with_context(|| format!("Vault response parse failed: {path}"))
    }

    async fn post_json<T: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
        authenticated: bool,
    ) -> Result<R> {
        let text = self.post_raw(path, body, authenticated).await?;
        parse_body(&text).with_context(|| format!("Vault response parse failed: {path}"))
    }

    async fn post_raw<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
        authenticated: bool,
    ) -> Result<String> {
        let mut request = self.client.post(self.endpoint(path)).json(body);
        if authenticated {
            request = request.header(VAULT_TOKEN_HEADER, self.token()?);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Vault request failed: {}/{path}", self.base_url))?;
        Self::response_text(response).await
    }

    async fn response_text(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read Vault response body")?;
        if !status.is_success() {
            return Err(status_error(status, text).into());
        }
        Ok(text)
    }
}

fn status_error(status: StatusCode, body: String) -> Error {
    Error::VaultStatus {
        status: status.as_u16(),
        body,
    }
}

fn parse_body<T: DeserializeOwned>(text: &str) -> Result<T> {
    let body = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(body).context("Failed to parse Vault response")
}

#[async_trait]
impl VaultApi for VaultClient {
    fn address(&self) -> &str {
        &self.base_url
    }

    fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    async fn init(&self, shares: u8, threshold: u8) -> Result<String> {
        #[derive(Serialize)]
        struct InitRequest {
            secret_shares: u8,
            secret_threshold: u8,
        }
        self.post_raw(
            "sys/init",
            &InitRequest {
                secret_shares: shares,
                secret_threshold: threshold,
            },
            false,
        )
        .await
    }

    async fn seal_status(&self) -> Result<SealStatus> {
        self.get_json("sys/seal-status").await
    }

    async fn unseal(&self, key: &str) -> Result<SealStatus> {
        #[derive(Serialize)]
        struct UnsealRequest<'a> {
            key: &'a str,
        }
        self.post_json("sys/unseal", &UnsealRequest { key }, false)
            .await
    }

    async fn enable_kv_v2(&self, mount: &str) -> Result<()> {
        if let Some(data) = self.get_mount(mount).await? {
            if data.mount_type != "kv" {
                anyhow::bail!("Mount {mount} exists but is not KV");
            }
            let version = data.options.and_then(|opt| opt.version);
            if version.as_deref() != Some("2") {
                anyhow::bail!("Mount {mount} exists but is not KV v2");
            }
            return Ok(());
        }
        #[derive(Serialize)]
        struct MountRequest<'a> {
            #[serde(rename = "type")]
            mount_type: &'a str,
            options: MountOptionsRequest<'a>,
        }
        #[derive(Serialize)]
        struct MountOptionsRequest<'a> {
            version: &'a str,
        }
        let _: serde_json::Value = self
            .post_json(
                &format!("sys/mounts/{mount}"),
                &MountRequest {
                    mount_type: "kv",
                    options: MountOptionsRequest { version: "2" },
                },
                true,
            )
            .await?;
        Ok(())
    }

    async fn write_policy(&self, name: &str, policy: &str) -> Result<()> {
        #[derive(Serialize)]
        struct PolicyRequest<'a> {
            policy: &'a str,
        }
        let _: serde_json::Value = self
            .post_json(
                &format!("sys/policies/acl/{name}"),
                &PolicyRequest { policy },
                true,
            )
            .await?;
        Ok(())
    }

    async fn create_orphan_token(&self, request: &TokenRequest) -> Result<String> {
        let response: TokenResponse = self
            .post_json("auth/token/create-orphan", request, true)
            .await?;
        Ok(response.auth.client_token)
    }

    async fn write_token_role(&self, name: &str, role: &serde_json::Value) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(&format!("auth/token/roles/{name}"), role, true)
            .await?;
        Ok(())
    }
}
