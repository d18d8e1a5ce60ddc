//! Cloudflare's published edge ranges, used as the HTTPS allow-list of the
//! provisioned firewall.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudflareIps {
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

impl CloudflareIps {
    /// Every range, IPv4 first.
    #[must_use]
    pub fn all(&self) -> Vec<String> {
        self.ipv4.iter().chain(&self.ipv6).cloned().collect()
    }
}

/// Fetches `<base_url>/ips-v4` and `<base_url>/ips-v6`.
///
/// # Errors
/// Returns an error if either list cannot be fetched or answers with a
/// status other than 200.
pub async fn fetch_ips(base_url: &str) -> Result<CloudflareIps> {
    let client = Client::builder()
        .build()
        .context("Failed to build Cloudflare HTTP client")?;
    let base_url = base_url.trim_end_matches('/');
    let ipv4 = fetch_list(&client, &format!("{base_url}/ips-v4")).await?;
    let ipv6 = fetch_list(&client, &format!("{base_url}/ips-v6")).await?;
    info!(ipv4 = ipv4.len(), ipv6 = ipv6.len(), "fetched cloudflare ranges");
    Ok(CloudflareIps { ipv4, ipv6 })
}

async fn fetch_list(client: &Client, url: &str) -> Result<Vec<String>> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Cloudflare request failed: {url}"))?;
    let status = response.status();
    if status != StatusCode::OK {
        anyhow::bail!("Cloudflare IP endpoint {url} could not be reached: {status}");
    }
    let body = response
        .text()
        .await
        .with_context(|| format!("Failed to read {url}"))?;
    Ok(parse_ranges(&body))
}

fn parse_ranges(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
