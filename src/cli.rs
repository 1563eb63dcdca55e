// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `cellrunner`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cellrunner",
    version,
    about = "Run `#%%` cells of a source file on a long-lived kernel.",
    long_about = None
)]
pub struct CliArgs {
    /// Source file split into cells by `#%%` / `##%%` marker lines.
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Path to the config file (TOML).
    ///
    /// Default: `Cellrunner.toml` in the current working directory, or
    /// built-in defaults when that file does not exist.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run only the cell containing this line (1-based).
    ///
    /// Without it every cell runs, top to bottom.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub row: Option<u64>,

    /// Run a parent cell together with its sub-cells.
    #[arg(long)]
    pub include_subcells: bool,

    /// Kernel spec name; overrides `[kernel].name`.
    #[arg(long, value_name = "NAME")]
    pub kernel: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CELLRUNNER_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse the file and print its cells, but don't start a kernel.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
