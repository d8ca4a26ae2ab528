//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "enose", version, about = "e-nose supervisory controller")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/enose.toml")]
    pub config: PathBuf,

    /// Path to the persisted load-cell calibration JSON
    #[arg(long, value_name = "FILE", default_value = "etc/load_cell_calibration.json")]
    pub calibration: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Statically validate a program file and print the diagnostics
    Validate {
        /// Program YAML file
        #[arg(long, value_name = "FILE")]
        program: PathBuf,
    },
    /// Load and run a program against the connected instrument
    Run {
        /// Program YAML file
        #[arg(long, value_name = "FILE")]
        program: PathBuf,
        /// Print each experiment event as it arrives
        #[arg(long, action = ArgAction::SetTrue)]
        follow: bool,
    },
    /// Connectivity check: firmware link up and reporting ready
    Check,
}
