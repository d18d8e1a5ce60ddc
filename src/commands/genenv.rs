use anyhow::Result;
use stackroot::{Settings, envrc};

use crate::GenenvArgs;

pub(crate) fn run_genenv(args: &GenenvArgs) -> Result<()> {
    let settings = Settings::load(&args.config.config_file)?;
    let path = envrc::generate(&settings.layout(), &args.target_dir)?;
    println!("wrote {}", path.display());
    Ok(())
}
