use anyhow::Result;
use stackroot::Settings;
use stackroot::orchestrator::{self, CliBackend};
use stackroot::runtime::ensure_dependencies;

use crate::ConfigArgs;

pub(crate) fn run_observability(args: &ConfigArgs) -> Result<()> {
    ensure_dependencies()?;
    let settings = Settings::load(&args.config_file)?;
    orchestrator::setup_observability(&settings, &args.config_file, &CliBackend)?;
    println!("observability stack configured for {}", settings.dc_name);
    Ok(())
}
