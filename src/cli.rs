use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, propagate_version = true)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[clap(long = "config", env = "SPAREWATT_CONFIG", default_value = "sparewatt.toml")]
    pub config_path: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Poll the meter and steer the plugs.
    Run,

    /// Validate the configuration and print the load roster.
    CheckConfig,
}
