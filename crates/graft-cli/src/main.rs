//! Graft CLI - host plugin modules and reload them without losing state

mod cli;
mod commands;
mod config;
mod error;

use clap::Parser;
use cli::{Cli, Commands};
use config::GraftConfig;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = GraftConfig::load(&config)?;
            init_logging(cli.verbose, &config.log_filter);

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run::run(config))?;
        }
        Commands::Inspect {
            module,
            skip_version_check,
        } => {
            init_logging(cli.verbose, "info");
            commands::inspect::run(&module, skip_version_check)?;
        }
    }

    Ok(())
}

/// `--verbose` forces debug, otherwise `RUST_LOG` wins over `default_filter`.
fn init_logging(verbose: bool, default_filter: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
