use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. debug, stackroot=trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Provision, configure and bootstrap the datacenter
    Sync(ConfigArgs),
    /// Write an .envrc pointing the consul, vault and nomad CLIs at the cluster
    Genenv(GenenvArgs),
    /// Configure metrics, logs and traces on an existing cluster
    Observability(ConfigArgs),
    /// Show what the base directory holds
    Status(ConfigArgs),
}

#[derive(Args, Debug)]
pub(crate) struct ConfigArgs {
    /// Path to the datacenter configuration file
    #[arg(short = 'f', long)]
    config_file: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct GenenvArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Directory the .envrc is written to
    #[arg(short = 't', long, default_value = ".")]
    target_dir: PathBuf,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("stackroot error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level)
            .with_context(|| format!("Invalid log level: {}", cli.log_level))?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        CliCommand::Sync(args) => commands::sync::run_sync(&args)?,
        CliCommand::Genenv(args) => commands::genenv::run_genenv(&args)?,
        CliCommand::Observability(args) => {
            commands::observability::run_observability(&args)?;
        }
        CliCommand::Status(args) => commands::status::run_status(&args)?,
    }
    Ok(())
}
