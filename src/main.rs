use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use morphfit::batch::BatchRunner;
use morphfit::settings::{self, CliArgs};

fn main() -> Result<()> {
    let args = CliArgs::parse();

    // RUST_LOG wins unless --verbose is given
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let settings = settings::load_config(&args)?;
    info!("{}", settings);

    let mut runner = BatchRunner::new(settings)?;
    runner.solve()?;
    runner.writeup()?;

    Ok(())
}
