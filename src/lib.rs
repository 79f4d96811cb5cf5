//! groundwork library
//!
//! The orchestration core of a declarative OS installer: configuration
//! bootstrap, working-environment construction, the stage/command
//! execution engine, failure-and-cleanup orchestration, boot-configuration
//! parsing for kernel re-exec, and power-state command synthesis.
//!
//! The individual installation stages (partitioning, network, extraction,
//! hooks) are external commands; this crate only sequences and supervises
//! them through the environment-variable contract in [`workdir`].

pub mod cli;
pub mod collect_logs;
pub mod config;
pub mod distro;
pub mod error;
pub mod install;
pub mod kexec;
pub mod power;
pub mod reporter;
pub mod stage;
pub mod teardown;
pub mod util;
pub mod workdir;

// Re-export main types for convenience
pub use config::{Config, InstallOptions};
pub use error::{InstallError, Result};
pub use install::run_install;
pub use kexec::{apply_kexec, parse_default_boot_entry, BootEntry};
pub use power::{apply_power_state, load_power_state};
pub use reporter::{EventSink, LogSink, Outcome, ReportLevel, ReportScope, Reporter};
pub use stage::{CommandSpec, Stage, REPORT_SCOPE_VAR};
pub use util::{sanitize_source, SourceSpec};
pub use workdir::WorkingDir;
