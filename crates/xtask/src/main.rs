mod build;
mod cli;
mod constants;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use constants::TARGET;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Test { features, release } => {
            build::test_all(features.as_deref(), *release)?;
        }
        Commands::Build { features, release, target } => {
            build::build_no_std(target, features.as_deref(), *release)?;
            println!("Build complete!");
        }
        Commands::Ci => {
            // defmt needs a global logger, so it is only checked on target.
            build::test_all(None, false)?;
            build::build_no_std(TARGET, None, true)?;
            build::build_no_std(TARGET, Some("defmt"), true)?;
            println!("All checks passed!");
        }
    }

    Ok(())
}
