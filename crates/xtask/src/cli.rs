use clap::{Parser, Subcommand};

use crate::constants::TARGET;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the host test suites
    Test {
        #[arg(long)]
        features: Option<String>,

        #[arg(long)]
        release: bool,
    },
    /// Cross-compile the no_std crates
    Build {
        #[arg(long)]
        features: Option<String>,

        #[arg(long)]
        release: bool,

        #[arg(long, default_value = TARGET)]
        target: String,
    },
    /// Run the tests, then cross-compile with and without defmt
    Ci,
}
