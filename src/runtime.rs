//! Shell execution for the external toolchain (`consul`, `nomad`, `cfssl`,
//! `openssl`, `terraform`, `ansible-playbook`).
//!
//! Every call goes through `/bin/sh -c` so pipelines such as
//! `cfssl gencert ... | cfssljson -bare ca` work unchanged. Per-call settings
//! (addresses, tokens, certificate paths) are passed as child environment
//! variables, never spliced into the command line.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::Error;

const SHELL: &str = "/bin/sh";

/// Binaries a full `sync` run shells out to.
pub const REQUIRED_BINARIES: &[&str] = &[
    "consul",
    "nomad",
    "ansible-playbook",
    "cfssl",
    "cfssljson",
    "openssl",
    "terraform",
];

/// Environment a command runs in: extra variables and an optional working directory.
pub trait Environment {
    fn variables(&self) -> BTreeMap<String, String>;

    fn working_directory(&self) -> Option<&Path> {
        None
    }
}

/// Inherit the parent environment and working directory unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyEnv;

impl Environment for EmptyEnv {
    fn variables(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Run inside a specific directory with optional extra variables.
#[derive(Debug, Clone, Default)]
pub struct DirEnv {
    dir: PathBuf,
    vars: BTreeMap<String, String>,
}

impl DirEnv {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            vars: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl Environment for DirEnv {
    fn variables(&self) -> BTreeMap<String, String> {
        self.vars.clone()
    }

    fn working_directory(&self) -> Option<&Path> {
        Some(&self.dir)
    }
}

/// Stdout and exit code of a command whose failure the caller interprets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
}

fn shell_command(env: &dyn Environment, command: &str) -> Command {
    let mut cmd = Command::new(SHELL);
    cmd.arg("-c").arg(command).envs(env.variables());
    if let Some(dir) = env.working_directory() {
        cmd.current_dir(dir);
    }
    cmd
}

/// Runs `command` with inherited stdio so tool output streams to the operator.
///
/// # Errors
/// Returns an error if the shell cannot be spawned or the command exits non-zero.
pub fn exec(env: &dyn Environment, command: &str) -> Result<()> {
    debug!(command, "exec");
    let status = shell_command(env, command)
        .status()
        .with_context(|| format!("Failed to run {command}"))?;
    if !status.success() {
        return Err(Error::CommandFailed {
            command: command.to_string(),
            status: status.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Runs `command` and returns its stdout; stderr stays attached to the terminal.
///
/// # Errors
/// Returns an error if the shell cannot be spawned, the command exits non-zero,
/// or stdout is not UTF-8.
pub fn exec_output(env: &dyn Environment, command: &str) -> Result<String> {
    let output = exec_status(env, command)?;
    if output.code != Some(0) {
        return Err(Error::CommandFailed {
            command: command.to_string(),
            status: output.code.map_or_else(
                || "terminated by signal".to_string(),
                |code| format!("exit status: {code}"),
            ),
        }
        .into());
    }
    Ok(output.stdout)
}

/// Runs `command` and returns stdout plus exit code without judging the code.
///
/// # Errors
/// Returns an error if the shell cannot be spawned or stdout is not UTF-8.
pub fn exec_status(env: &dyn Environment, command: &str) -> Result<CommandOutput> {
    debug!(command, "exec");
    let output = shell_command(env, command)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .with_context(|| format!("Failed to run {command}"))?;
    let stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("{command} produced non UTF-8 output"))?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout,
    })
}

/// Quotes `value` as a single shell word.
#[must_use]
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Lists the required binaries that cannot be found on `PATH`.
#[must_use]
pub fn missing_dependencies() -> Vec<&'static str> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    missing_from(&path, REQUIRED_BINARIES)
}

/// Fails with a readable list when any required binary is missing.
///
/// # Errors
/// Returns an error naming every missing binary.
pub fn ensure_dependencies() -> Result<()> {
    let missing = missing_dependencies();
    if missing.is_empty() {
        return Ok(());
    }
    let list = missing
        .iter()
        .map(|name| format!("- {name}"))
        .collect::<Vec<_>>()
        .join("\n");
    anyhow::bail!(
        "Local dependencies unsatisfied. Install the following and ensure they are on the PATH:\n{list}"
    );
}

fn missing_from(path_var: &OsStr, binaries: &[&'static str]) -> Vec<&'static str> {
    let dirs: Vec<PathBuf> = std::env::split_paths(path_var).collect();
    binaries
        .iter()
        .copied()
        .filter(|binary| !dirs.iter().any(|dir| is_executable(&dir.join(binary))))
        .collect()
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
