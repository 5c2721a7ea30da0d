//! Command-line interface definitions for dbfixture.
//!
//! The binary is a maintenance tool around the fixture cache: it lists the
//! snapshots and file-based databases on disk and purges stale ones. Builds
//! themselves are driven by the test harness through the library.
//!
//! # Example
//!
//! ```bash
//! # Show snapshots and databases with their sizes
//! dbfixture list
//!
//! # Remove snapshots and databases built from outdated sources
//! dbfixture purge --grace-period 1h
//!
//! # Remove everything the cache owns
//! dbfixture -c ci/dbfixture.toml purge --all
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Fingerprinting fixture cache for test databases.
#[derive(Debug, Parser)]
#[command(name = "dbfixture")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (defaults to ./dbfixture.toml when present)
    #[arg(short, long, global = true, value_name = "FILE", env = "DBFIXTURE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Report errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List snapshots and file-based fixture databases
    List(ListArgs),
    /// Remove stale snapshots and fixture databases
    Purge(PurgeArgs),
}

/// Arguments for the list subcommand.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for the purge subcommand.
#[derive(Debug, Args)]
pub struct PurgeArgs {
    /// Remove entries built from the current sources too, ignoring the
    /// grace period
    #[arg(long)]
    pub all: bool,

    /// Only remove entries unused for at least this long (e.g. 90s, 30m, 4h, 2d)
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, conflicts_with = "all")]
    pub grace_period: Option<Duration>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    Text,
    /// JSON output for scripting
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Parse a duration such as `90`, `90s`, `30m`, `4h` or `2d`.
///
/// Numbers without suffix are seconds.
///
/// # Examples
///
/// ```
/// use dbfixture::cli::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
/// assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
/// ```
/// # Errors
///
/// Returns an error if the string is empty, the number is invalid, or the
/// suffix is unknown.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&s[..idx], s[idx..].trim().to_lowercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number: '{num_str}'"))?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return Err(format!("Unknown duration suffix: '{suffix}'")),
    };

    num.checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Duration too large: '{s}'"))
}
