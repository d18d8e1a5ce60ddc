//! Read-only report of what a datacenter's base directory holds.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use time::OffsetDateTime;
use x509_parser::extensions::{GeneralName, ParsedExtension};

use crate::certs;
use crate::credentials;
use crate::inventory::Inventory;
use crate::layout::Layout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateState {
    Missing,
    Valid { not_after: OffsetDateTime },
    Expired { not_after: OffsetDateTime },
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateStatus {
    pub name: &'static str,
    pub path: PathBuf,
    pub state: CertificateState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub base_dir: PathBuf,
    /// `None` when no inventory has been written yet.
    pub groups: Option<Vec<(&'static str, usize)>>,
    /// (field, issued); `None` when no secrets record exists.
    pub tokens: Option<Vec<(&'static str, bool)>>,
    pub vault_transcript: bool,
    pub certificates: Vec<CertificateStatus>,
    /// Nomad server names missing from the server certificate's SANs.
    pub nomad_uncovered: Vec<String>,
    pub now: OffsetDateTime,
}

/// Gathers the report without contacting any host.
///
/// # Errors
/// Returns an error if an existing inventory or secrets record cannot be parsed.
pub fn collect(layout: &Layout, now: OffsetDateTime) -> Result<StatusReport> {
    let inventory = if layout.inventory().exists() {
        Some(Inventory::load(&layout.inventory())?)
    } else {
        None
    };
    let tokens = if credentials::exists(layout.base_dir()) {
        let secrets = credentials::load(layout.base_dir())?;
        Some(
            secrets
                .token_fields()
                .into_iter()
                .map(|(name, token)| (name, !token.is_pending()))
                .collect(),
        )
    } else {
        None
    };

    let groups = inventory.as_ref().map(|inventory| {
        let groups = inventory.groups();
        vec![
            ("clients", groups.clients.len()),
            ("nomad_servers", groups.nomad_servers.len()),
            ("consul_servers", groups.consul_servers.len()),
            ("vault_servers", groups.vault_servers.len()),
            ("prometheus", groups.prometheus.len()),
            ("grafana", groups.grafana.len()),
            ("loki", groups.loki.len()),
            ("tempo", groups.tempo.len()),
        ]
    });

    let certificates = [
        ("consul agent CA", layout.consul_client_cert()),
        ("nomad CA", layout.nomad_ca_cert()),
        ("nomad server", layout.nomad_server_cert()),
        ("nomad client", layout.nomad_client_cert()),
        ("nomad cli", layout.nomad_cli_cert()),
        ("vault tls", layout.vault_tls_cert()),
    ]
    .into_iter()
    .map(|(name, path)| CertificateStatus {
        name,
        state: certificate_state(&path, now),
        path,
    })
    .collect();

    let nomad_uncovered = match (&inventory, std::fs::read(layout.nomad_server_cert())) {
        (Some(inventory), Ok(pem)) => {
            let names = subject_alt_names(&pem).with_context(|| {
                format!("Failed to read SANs of {}", layout.nomad_server_cert().display())
            })?;
            certs::nomad_hostnames(inventory)
                .into_iter()
                .filter(|expected| !names.contains(expected))
                .collect()
        }
        _ => Vec::new(),
    };

    Ok(StatusReport {
        base_dir: layout.base_dir().to_path_buf(),
        groups,
        tokens,
        vault_transcript: layout.vault_init_transcript().exists(),
        certificates,
        nomad_uncovered,
        now,
    })
}

fn certificate_state(path: &Path, now: OffsetDateTime) -> CertificateState {
    let Ok(pem) = std::fs::read(path) else {
        return CertificateState::Missing;
    };
    match not_after(&pem) {
        Ok(not_after) if not_after <= now => CertificateState::Expired { not_after },
        Ok(not_after) => CertificateState::Valid { not_after },
        Err(err) => CertificateState::Unreadable(format!("{err:#}")),
    }
}

/// Expiry of a PEM certificate.
///
/// # Errors
/// Returns an error if the PEM or the certificate cannot be parsed.
pub fn not_after(pem: &[u8]) -> Result<OffsetDateTime> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|e| anyhow::anyhow!("Failed to parse PEM certificate: {e}"))?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse X509 certificate: {e}"))?;
    Ok(cert.validity().not_after.to_datetime())
}

/// DNS names and IP addresses a PEM certificate is valid for.
///
/// # Errors
/// Returns an error if the PEM or the certificate cannot be parsed.
pub fn subject_alt_names(pem: &[u8]) -> Result<Vec<String>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|e| anyhow::anyhow!("Failed to parse PEM certificate: {e}"))?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse X509 certificate: {e}"))?;
    let mut names = Vec::new();
    for extension in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns_name) => names.push((*dns_name).to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(address) = ip_from_bytes(bytes) {
                            names.push(address.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(names)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    <[u8; 16]>::try_from(bytes)
        .ok()
        .map(|octets| IpAddr::V6(Ipv6Addr::from(octets)))
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "base directory: {}", self.base_dir.display())?;

        writeln!(f, "inventory:")?;
        match &self.groups {
            Some(groups) => {
                for (name, count) in groups {
                    writeln!(f, "  {name}: {count}")?;
                }
            }
            None => writeln!(f, "  not provisioned")?,
        }

        writeln!(f, "credentials:")?;
        match &self.tokens {
            Some(tokens) => {
                for (name, issued) in tokens {
                    let state = if *issued { "issued" } else { "pending" };
                    writeln!(f, "  {name}: {state}")?;
                }
            }
            None => writeln!(f, "  no secrets record")?,
        }
        let transcript = if self.vault_transcript {
            "present"
        } else {
            "missing"
        };
        writeln!(f, "  vault init transcript: {transcript}")?;

        writeln!(f, "certificates:")?;
        for cert in &self.certificates {
            match &cert.state {
                CertificateState::Missing => writeln!(f, "  {}: missing", cert.name)?,
                CertificateState::Valid { not_after } => writeln!(
                    f,
                    "  {}: expires {} ({} days)",
                    cert.name,
                    not_after.date(),
                    (*not_after - self.now).whole_days()
                )?,
                CertificateState::Expired { not_after } => {
                    writeln!(f, "  {}: EXPIRED {}", cert.name, not_after.date())?;
                }
                CertificateState::Unreadable(reason) => {
                    writeln!(f, "  {}: unreadable ({reason})", cert.name)?;
                }
            }
        }
        if !self.nomad_uncovered.is_empty() {
            writeln!(
                f,
                "warning: nomad server certificate does not cover {}; certificates are not reissued by sync",
                self.nomad_uncovered.join(", ")
            )?;
        }
        Ok(())
    }
}
