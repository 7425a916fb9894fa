//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Graft - host plugin modules and swap them live
#[derive(Parser)]
#[command(name = "graft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Load the configured plugins and accept commands on stdin
    Run {
        /// Host configuration file
        #[arg(short, long, default_value = "graft.toml", env = "GRAFT_CONFIG")]
        config: PathBuf,
    },

    /// Print the types and commands published by a module library
    Inspect {
        /// Module library path
        module: PathBuf,

        /// Skip the module API version check
        #[arg(long)]
        skip_version_check: bool,
    },
}
