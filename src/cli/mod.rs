//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Interop test driver: resolves flagfiles, provisions per-run resources,
/// runs the test binary and tears everything down again
#[derive(Parser, Debug)]
#[command(name = "interop-driver")]
#[command(version = "0.1.0")]
#[command(about = "Provision, run and tear down interop test environments")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Root flagfile; may include others with --flagfile=
    #[arg(short, long, global = true)]
    pub flagfile: Option<PathBuf>,

    /// Override a key (repeatable), applied after the flagfile and environment
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE", global = true, value_parser = parse_key_value)]
    pub overrides: Vec<(String, String)>,

    /// Ignore INTEROP_DRIVER_* environment variables
    #[arg(long, global = true)]
    pub no_env: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective configuration
    Resolve(ResolveArgs),

    /// Print the resource names of a run
    Name(NameArgs),

    /// Provision, run the test binary, tear down
    Run(RunArgs),

    /// Tear down the resources of a pinned run left behind by a crash
    Cleanup(CleanupArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Flags,
    Json,
    Yaml,
}

#[derive(Parser, Debug)]
pub struct ResolveArgs {
    #[arg(long, value_enum, default_value = "flags")]
    pub format: OutputFormat,

    /// List every known flag with its value, origin and help instead
    #[arg(long, conflicts_with = "format")]
    pub explain: bool,
}

#[derive(Parser, Debug)]
pub struct NameArgs {
    /// Print only this component's name, e.g. `server`
    #[arg(short, long)]
    pub component: Option<String>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Provision and tear down without running the test binary
    #[arg(long)]
    pub skip_tests: bool,

    /// Extra arguments passed to the test binary
    #[arg(last = true)]
    pub extra: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Also sweep a random-suffix run by giving its suffix
    #[arg(long)]
    pub suffix: Option<String>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim().trim_start_matches("--");
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
