//! Certificate material for the cluster, produced by the external CA
//! toolchain (`consul tls`, `cfssl`/`cfssljson`, `openssl`).
//!
//! Each issuer checks for one sentinel output file and does nothing when it
//! exists, so certificates are never rotated by a bootstrap run. A failure
//! half way leaves whatever files were produced in place.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::fs_util;
use crate::inventory::Inventory;
use crate::layout::Layout;
use crate::runtime::{self, DirEnv, quote};
use crate::templates;

const NOMAD_CA_NAME: &str = "nomad-ca";
const NOMAD_LEAVES: [&str; 3] = ["server", "client", "cli"];
const NOMAD_SERVER_NAME: &str = "server.global.nomad";
const VAULT_FIXED_SANS: [&str; 3] = [
    "IP:0.0.0.0",
    "DNS:vault.service.consul",
    "DNS:active.vault.service.consul",
];

/// Runs one CA toolchain command inside `working_dir`.
pub trait CaToolchain {
    /// # Errors
    /// Returns an error if the command cannot be run or fails.
    fn run(&self, working_dir: &Path, command: &str) -> Result<()>;
}

/// Shells out to the locally installed toolchain.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliToolchain;

impl CaToolchain for CliToolchain {
    fn run(&self, working_dir: &Path, command: &str) -> Result<()> {
        runtime::exec(&DirEnv::new(working_dir), command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueResult {
    Issued,
    Skipped,
}

/// Creates the Consul agent CA and a server certificate for `datacenter`.
///
/// # Errors
/// Returns an error if the secrets directory cannot be prepared or a toolchain call fails.
pub fn issue_consul_certs(
    toolchain: &dyn CaToolchain,
    layout: &Layout,
    datacenter: &str,
) -> Result<IssueResult> {
    if layout.consul_client_cert().exists() {
        return Ok(IssueResult::Skipped);
    }
    let dir = layout.consul_secrets_dir();
    fs_util::ensure_secrets_dir(&dir)?;
    toolchain.run(&dir, "consul tls ca create")?;
    toolchain.run(
        &dir,
        &format!("consul tls cert create -server -dc {}", quote(datacenter)),
    )?;
    info!(dir = %dir.display(), "issued consul certificates");
    Ok(IssueResult::Issued)
}

/// Names every Nomad certificate is valid for.
#[must_use]
pub fn nomad_hostnames(inventory: &Inventory) -> Vec<String> {
    let servers = &inventory.groups().nomad_servers;
    std::iter::once(NOMAD_SERVER_NAME)
        .chain(servers.hosts())
        .chain(servers.private_addresses())
        .map(str::to_string)
        .collect()
}

/// Creates the Nomad CA plus server, client and operator certificates.
///
/// # Errors
/// Returns an error if the signing config cannot be written or a toolchain call fails.
pub fn issue_nomad_certs(
    toolchain: &dyn CaToolchain,
    layout: &Layout,
    inventory: &Inventory,
) -> Result<IssueResult> {
    if layout.nomad_cli_cert().exists() {
        return Ok(IssueResult::Skipped);
    }
    let dir = layout.nomad_secrets_dir();
    fs_util::ensure_secrets_dir(&dir)?;
    fs_util::write_private(&dir.join("cfssl.json"), templates::raw("nomad/cfssl.json")?)?;

    toolchain.run(
        &dir,
        &format!("cfssl print-defaults csr | cfssl gencert -initca - | cfssljson -bare {NOMAD_CA_NAME}"),
    )?;
    let hostnames = quote(&nomad_hostnames(inventory).join(","));
    for leaf in NOMAD_LEAVES {
        toolchain.run(
            &dir,
            &format!(
                "echo '{{}}' | cfssl gencert -ca={NOMAD_CA_NAME}.pem -ca-key={NOMAD_CA_NAME}-key.pem \
                 -config=cfssl.json -hostname={hostnames} - | cfssljson -bare {leaf}"
            ),
        )?;
    }
    info!(dir = %dir.display(), "issued nomad certificates");
    Ok(IssueResult::Issued)
}

/// Subject alternative names for the Vault listener certificate.
#[must_use]
pub fn vault_subject_alt_names(inventory: &Inventory) -> Vec<String> {
    let hosts = inventory
        .groups()
        .vault_servers
        .private_addresses()
        .into_iter()
        .map(|address| {
            if address.parse::<IpAddr>().is_ok() {
                format!("IP:{address}")
            } else {
                format!("DNS:{address}")
            }
        });
    VAULT_FIXED_SANS
        .iter()
        .map(|san| (*san).to_string())
        .chain(hosts)
        .collect()
}

/// Creates Vault's self-signed TLS key pair.
///
/// # Errors
/// Returns an error if the secrets directory cannot be prepared or `openssl` fails.
pub fn issue_vault_tls(
    toolchain: &dyn CaToolchain,
    layout: &Layout,
    org_name: &str,
    inventory: &Inventory,
) -> Result<IssueResult> {
    let key = layout.vault_tls_key();
    if key.exists() {
        return Ok(IssueResult::Skipped);
    }
    let dir = layout.vault_secrets_dir();
    fs_util::ensure_secrets_dir(&dir)?;
    let cert = layout.vault_tls_cert();
    let subject = quote(&format!("/O={org_name}/CN=Vault"));
    let san = quote(&format!(
        "subjectAltName = {}",
        vault_subject_alt_names(inventory).join(",")
    ));
    toolchain.run(
        &dir,
        &format!(
            "openssl req -out {} -new -keyout {} -newkey rsa:4096 -nodes -sha256 -x509 \
             -subj {subject} -addext {san}",
            quote(&cert.to_string_lossy()),
            quote(&key.to_string_lossy()),
        ),
    )?;
    info!(cert = %cert.display(), "issued vault tls certificate");
    Ok(IssueResult::Issued)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;
    use crate::inventory::{Host, HostGroup};

    /// Records commands and creates the files the real tools would leave behind.
    #[derive(Default)]
    struct RecordingToolchain {
        calls: RefCell<Vec<(PathBuf, String)>>,
    }

    impl CaToolchain for RecordingToolchain {
        fn run(&self, working_dir: &Path, command: &str) -> Result<()> {
            self.calls
                .borrow_mut()
                .push((working_dir.to_path_buf(), command.to_string()));
            if command.starts_with("consul tls ca create") {
                std::fs::write(working_dir.join("consul-agent-ca.pem"), "ca")?;
            }
            if command.ends_with("cfssljson -bare cli") {
                std::fs::write(working_dir.join("cli.pem"), "cli")?;
            }
            if command.starts_with("openssl req") {
                std::fs::write(working_dir.join("tls.key"), "key")?;
            }
            Ok(())
        }
    }

    fn group(entries: &[(&str, &str)]) -> HostGroup {
        HostGroup {
            hosts: entries
                .iter()
                .map(|(host, ip)| {
                    (
                        (*host).to_string(),
                        Host {
                            private_ip: (*ip).to_string(),
                            host_name: format!("name-{host}"),
                            ..Host::default()
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn inventory() -> Inventory {
        let mut inventory = Inventory::default();
        inventory.all.children.nomad_servers = group(&[("1.1.1.1", "10.0.0.1"), ("1.1.1.2", "10.0.0.2")]);
        inventory.all.children.vault_servers = group(&[("3.3.3.1", "10.0.2.1")]);
        inventory
    }

    #[test]
    fn test_consul_certs_are_issued_once() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let toolchain = RecordingToolchain::default();

        let first = issue_consul_certs(&toolchain, &layout, "dc1").expect("first");
        let second = issue_consul_certs(&toolchain, &layout, "dc1").expect("second");

        assert_eq!(first, IssueResult::Issued);
        assert_eq!(second, IssueResult::Skipped);
        let calls = toolchain.calls.borrow();
        let commands: Vec<_> = calls.iter().map(|(_, command)| command.as_str()).collect();
        assert_eq!(
            commands,
            vec!["consul tls ca create", "consul tls cert create -server -dc 'dc1'"]
        );
        assert!(calls.iter().all(|(dir, _)| *dir == layout.consul_secrets_dir()));
    }

    #[test]
    fn test_nomad_certs_cover_servers_and_are_issued_once() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let toolchain = RecordingToolchain::default();

        assert_eq!(
            issue_nomad_certs(&toolchain, &layout, &inventory()).expect("first"),
            IssueResult::Issued
        );
        assert_eq!(
            issue_nomad_certs(&toolchain, &layout, &inventory()).expect("second"),
            IssueResult::Skipped
        );

        let calls = toolchain.calls.borrow();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].1.contains("cfssljson -bare nomad-ca"));
        for (call, leaf) in calls[1..].iter().zip(["server", "client", "cli"]) {
            assert!(call.1.contains("-hostname='server.global.nomad,1.1.1.1,1.1.1.2,10.0.0.1,10.0.0.2'"));
            assert!(call.1.ends_with(&format!("cfssljson -bare {leaf}")));
        }
        assert!(layout.nomad_secrets_dir().join("cfssl.json").exists());
    }

    #[test]
    fn test_vault_tls_names_every_vault_host_and_is_issued_once() {
        let dir = tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        let toolchain = RecordingToolchain::default();

        issue_vault_tls(&toolchain, &layout, "Example", &inventory()).expect("first");
        let second = issue_vault_tls(&toolchain, &layout, "Example", &inventory()).expect("second");

        assert_eq!(second, IssueResult::Skipped);
        let calls = toolchain.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.contains("-subj '/O=Example/CN=Vault'"));
        assert!(calls[0].1.contains(
            "'subjectAltName = IP:0.0.0.0,DNS:vault.service.consul,DNS:active.vault.service.consul,IP:10.0.2.1'"
        ));
    }

    #[test]
    fn test_vault_sans_use_dns_for_names() {
        let mut inventory = inventory();
        inventory.all.children.vault_servers = group(&[("3.3.3.1", "vault-0.internal")]);
        let sans = vault_subject_alt_names(&inventory);
        assert_eq!(sans.last().map(String::as_str), Some("DNS:vault-0.internal"));
    }
}
