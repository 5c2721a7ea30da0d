//! dbfixture - Fingerprinting Fixture Cache for Test Databases
//!
//! Builds a test database once per combination of source files and
//! scenario, keeps it between runs, and wraps every test in a rolled-back
//! transaction or a trigger-based change journal so the next test starts
//! from the same state. Snapshots taken after migrations or seeders let a
//! rebuild skip the slow steps.
//!
//! ```rust,no_run
//! use dbfixture::build::{BuildOrchestrator, BuildSettings, StepError};
//! use dbfixture::cache::EngineCache;
//! use dbfixture::db::{Driver, SqliteDriver};
//! use std::path::Path;
//!
//! let mut driver = SqliteDriver::new(".dbfixture/databases");
//! let mut migrate = |_: &mut dyn Driver, _: &Path| -> Result<(), StepError> { Ok(()) };
//! let mut seed = |_: &mut dyn Driver, _: &[String]| -> Result<(), StepError> { Ok(()) };
//! let mut cache = EngineCache::new();
//!
//! let mut build = BuildOrchestrator::new(
//!     BuildSettings::default(),
//!     &mut driver,
//!     &mut migrate,
//!     &mut seed,
//! );
//! let resolved = build.execute(&mut cache)?;
//! build.run_post_build_steps()?;
//! // ... run the test against `resolved.database` ...
//! build.run_post_test_steps()?;
//! # Ok::<(), dbfixture::build::BuildError>(())
//! ```

pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod journal;
pub mod logging;
pub mod reuse;
pub mod snapshot;
pub mod transaction;

use std::fs;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::build::BuildError;
use crate::cli::{Cli, Commands, OutputFormat, PurgeArgs};
use crate::config::Config;
use crate::db::{Driver, DriverKind, SqliteDriver};
use crate::error::ExitCode;
use crate::fingerprint::{database_source_fragment, Fingerprinter};
use crate::snapshot::{
    list_snapshots, purge_stale_databases, purge_stale_snapshots, PurgeOptions, PurgeReport,
};

/// Run the CLI application logic.
pub fn run_app(cli: Cli) -> anyhow::Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet);

    let config = Config::try_load_from_path(cli.config.as_deref())
        .context("Failed to load configuration")?;
    log::debug!("Using {} driver", config.driver);

    match cli.command {
        Commands::List(args) => handle_list(&config, args.output),
        Commands::Purge(args) => handle_purge(&config, &args),
    }
}

#[derive(Debug, Serialize)]
struct SnapshotEntry {
    file: String,
    original: String,
    source: String,
    size: u64,
    modified: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct DatabaseEntry {
    name: String,
    size: u64,
}

#[derive(Debug, Default, Serialize)]
struct Listing {
    snapshots: Vec<SnapshotEntry>,
    databases: Vec<DatabaseEntry>,
}

fn handle_list(config: &Config, output: OutputFormat) -> anyhow::Result<ExitCode> {
    let build = &config.build;
    let mut listing = Listing::default();

    for snapshot in list_snapshots(&build.snapshot_directory, &build.snapshot_prefix)
        .context("Failed to list snapshots")?
    {
        listing.snapshots.push(SnapshotEntry {
            file: snapshot.path.display().to_string(),
            original: snapshot.name.original,
            source: snapshot.name.source,
            size: snapshot.size,
            modified: DateTime::<Utc>::from(snapshot.modified),
        });
    }

    match config.driver {
        DriverKind::Sqlite => {
            let driver = SqliteDriver::new(&config.sqlite.directory);
            for name in driver.list_databases().context("Failed to list databases")? {
                if database_source_fragment(&build.fingerprint.prefix, &name).is_none() {
                    continue;
                }
                let size = fs::metadata(driver.database_path(&name))
                    .map(|m| m.len())
                    .unwrap_or(0);
                listing.databases.push(DatabaseEntry { name, size });
            }
        }
        DriverKind::Mysql => {
            log::warn!("Listing MySQL databases needs a server connection; showing snapshots only");
        }
    }

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
        OutputFormat::Text => print_listing(&listing),
    }
    Ok(ExitCode::Success)
}

fn print_listing(listing: &Listing) {
    println!("Snapshots ({}):", listing.snapshots.len());
    for s in &listing.snapshots {
        println!(
            "  {:>10}  {}  {}",
            ByteSize::b(s.size).to_string(),
            s.modified.format("%Y-%m-%d %H:%M"),
            s.file
        );
    }
    println!("Databases ({}):", listing.databases.len());
    for d in &listing.databases {
        println!("  {:>10}  {}", ByteSize::b(d.size).to_string(), d.name);
    }
    let total: u64 = listing
        .snapshots
        .iter()
        .map(|s| s.size)
        .chain(listing.databases.iter().map(|d| d.size))
        .sum();
    println!("Total: {}", ByteSize::b(total));
}

fn handle_purge(config: &Config, args: &PurgeArgs) -> anyhow::Result<ExitCode> {
    let build = &config.build;
    let options = if args.all {
        PurgeOptions {
            grace_period: Duration::ZERO,
            include_current: true,
        }
    } else {
        PurgeOptions {
            grace_period: args
                .grace_period
                .unwrap_or_else(|| build.purge_options().grace_period),
            include_current: false,
        }
    };

    // Everything goes with --all, so the sources need not be readable.
    let source_hash = if args.all {
        String::new()
    } else {
        Fingerprinter::new(build.fingerprint.clone())
            .compute_source_files_hash()
            .map_err(BuildError::from)
            .context("Failed to fingerprint sources")?
    };

    let mut report = purge_stale_snapshots(
        &build.snapshot_directory,
        &build.snapshot_prefix,
        &source_hash,
        options,
        SystemTime::now(),
    )
    .context("Failed to purge snapshots")?;

    match config.driver {
        DriverKind::Sqlite => {
            let mut driver = SqliteDriver::new(&config.sqlite.directory);
            let databases = purge_stale_databases(
                &mut driver,
                &build.fingerprint.prefix,
                &build.project_name,
                &source_hash,
                options,
                Utc::now(),
            )
            .context("Failed to purge databases")?;
            report.merge(databases);
        }
        DriverKind::Mysql => {
            log::warn!("Purging MySQL databases needs a server connection; snapshots only");
        }
    }

    print_purge_report(&report, args.output)?;
    if report.is_partial() {
        Ok(ExitCode::PartialSuccess)
    } else {
        Ok(ExitCode::Success)
    }
}

fn print_purge_report(report: &PurgeReport, output: OutputFormat) -> anyhow::Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            for removed in &report.removed {
                println!("removed  {removed}");
            }
            for failed in &report.failed {
                println!("failed   {failed}");
            }
            println!(
                "{} removed, {} failed",
                report.removed.len(),
                report.failed.len()
            );
        }
    }
    Ok(())
}
