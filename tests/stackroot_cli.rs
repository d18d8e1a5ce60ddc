use std::fs;
use std::process::Command;

mod support;

fn stackroot() -> Command {
    Command::new(env!("CARGO_BIN_EXE_stackroot"))
}

#[test]
fn missing_config_file_reports_error_and_exits_1() {
    let dir = tempfile::tempdir().expect("tempdir");

    let output = stackroot()
        .args(["status", "-f"])
        .arg(dir.path().join("absent.yml"))
        .output()
        .expect("run stackroot");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("stackroot error: Failed to load config"));
}

#[test]
fn status_on_fresh_base_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("dc1");
    let config = support::write_config(dir.path(), &base);

    let output = stackroot()
        .args(["status", "-f"])
        .arg(&config)
        .output()
        .expect("run stackroot");

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("not provisioned"));
    assert!(stdout.contains("no secrets record"));
    assert!(stdout.contains("vault tls: missing"));
}

#[test]
fn genenv_without_previous_sync_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("dc1");
    let config = support::write_config(dir.path(), &base);

    let output = stackroot()
        .args(["genenv", "-f"])
        .arg(&config)
        .arg("-t")
        .arg(dir.path())
        .output()
        .expect("run stackroot");

    assert_eq!(output.status.code(), Some(1));
    assert!(!dir.path().join(".envrc").exists());
}

#[test]
fn genenv_refuses_envrc_without_separator() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("dc1");
    let config = support::write_config(dir.path(), &base);
    fs::create_dir_all(&base).expect("base dir");
    fs::write(
        base.join("inventory"),
        r"all:
  children:
    consul_servers:
      hosts:
        1.1.1.1:
          private_ip: 10.0.0.1
          host_name: dc1-1
    nomad_servers:
      hosts:
        1.1.1.1:
          private_ip: 10.0.0.1
          host_name: dc1-1
    vault_servers:
      hosts:
        3.3.3.3:
          private_ip: 10.0.2.1
          host_name: dc1-3
",
    )
    .expect("inventory");
    fs::create_dir_all(base.join("secrets")).expect("secrets dir");
    fs::write(
        base.join("secrets/secrets.yml"),
        "CONSUL_GOSSIP_KEY: a\nNOMAD_GOSSIP_KEY: b\nCONSUL_BOOTSTRAP_TOKEN: root\n\
         s3_endpoint: e\ns3_access_key: a\ns3_secret_key: s\n",
    )
    .expect("secrets");
    let target = dir.path().join("work");
    fs::create_dir_all(&target).expect("target");
    fs::write(target.join(".envrc"), "export FOO=bar\n").expect("envrc");

    let refused = stackroot()
        .args(["genenv", "-f"])
        .arg(&config)
        .arg("-t")
        .arg(&target)
        .output()
        .expect("run stackroot");
    assert_eq!(refused.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&refused.stderr).contains("is not separated by the line"));

    fs::remove_file(target.join(".envrc")).expect("remove");
    let written = stackroot()
        .args(["genenv", "-f"])
        .arg(&config)
        .arg("-t")
        .arg(&target)
        .output()
        .expect("run stackroot");
    assert!(written.status.success(), "{written:?}");
    let envrc = fs::read_to_string(target.join(".envrc")).expect("read envrc");
    assert!(envrc.contains("export CONSUL_HTTP_TOKEN=root\n"));
    assert!(envrc.contains("export VAULT_ADDR=https://3.3.3.3:8200\n"));
}
