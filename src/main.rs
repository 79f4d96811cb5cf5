//! groundwork - Main entry point
//!
//! Thin binary wrapper: logging setup, CLI parsing, configuration loading,
//! and exit-code mapping. All installation semantics live in the library.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use serde_yaml::Mapping;

use groundwork::cli::{Cli, Commands};
use groundwork::config::Config;
use groundwork::install::run_install;
use groundwork::reporter::LogSink;

/// Initialize the logger with appropriate settings
fn init_logger() {
    use env_logger::Builder;
    use std::io::Write;

    Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env() // Allows RUST_LOG env var to override
        .init();
}

fn load_fragments(paths: &[std::path::PathBuf]) -> Result<Vec<Mapping>> {
    paths
        .iter()
        .map(|path| load_fragment(path))
        .collect()
}

fn load_fragment(path: &Path) -> Result<Mapping> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {path:?}"))?;
    Config::parse_fragment(&content)
        .with_context(|| format!("failed to parse configuration from {path:?}"))
}

fn main() -> ExitCode {
    init_logger();

    let cli = Cli::parse_args();
    let result = match cli.command {
        Commands::Install { config, source } => install(&config, &source),
        Commands::Validate { config, source } => validate(&config, &source),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("groundwork: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn install(config: &[std::path::PathBuf], sources: &[String]) -> Result<()> {
    let fragments = load_fragments(config)?;
    let cfg = Config::bootstrap(&fragments, sources)?;
    run_install(&cfg, Arc::new(LogSink))?;
    Ok(())
}

fn validate(config: &[std::path::PathBuf], sources: &[String]) -> Result<()> {
    let fragments = load_fragments(config)?;
    let cfg = Config::bootstrap(&fragments, sources)?;
    info!("configuration validated");
    println!("configuration is valid ({} stage(s))", cfg.stages().len());
    Ok(())
}
