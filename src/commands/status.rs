use anyhow::Result;
use stackroot::{Settings, status};
use time::OffsetDateTime;

use crate::ConfigArgs;

pub(crate) fn run_status(args: &ConfigArgs) -> Result<()> {
    let settings = Settings::load(&args.config_file)?;
    let report = status::collect(&settings.layout(), OffsetDateTime::now_utc())?;
    print!("{report}");
    Ok(())
}
