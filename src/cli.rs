//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// groundwork - declarative OS installation orchestrator
#[derive(Parser)]
#[command(name = "groundwork")]
#[command(about = "Sequence and supervise the stages of an OS installation")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an installation
    Install {
        /// Read configuration from FILE; may be given multiple times,
        /// later files merge over earlier ones
        #[arg(short, long, value_name = "FILE")]
        config: Vec<PathBuf>,

        /// What to install (e.g. `dd-raw:/images/disk.img` or a URL)
        source: Vec<String>,
    },
    /// Merge and validate configuration files without installing
    Validate {
        /// Read configuration from FILE; may be given multiple times
        #[arg(short, long, value_name = "FILE")]
        config: Vec<PathBuf>,

        /// Install sources to validate alongside the configuration
        source: Vec<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
