use anyhow::{Context, Result};
use stackroot::Settings;
use stackroot::orchestrator::{self, CliBackend};
use stackroot::runtime::ensure_dependencies;

use crate::ConfigArgs;

pub(crate) fn run_sync(args: &ConfigArgs) -> Result<()> {
    ensure_dependencies()?;
    let settings = Settings::load(&args.config_file)?;
    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to initialize async runtime for sync")?;
    runtime.block_on(orchestrator::sync(&settings, &args.config_file, &CliBackend))
}
