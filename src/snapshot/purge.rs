//! Stale snapshot and database sweeps.
//!
//! A snapshot is stale when the source hash encoded in its file name no
//! longer matches the current one. A scenario database is stale when its
//! reuse record belongs to this project but was built from other sources
//! or by an incompatible version. Either is only removed once it has been
//! unused for longer than the grace period, so a sibling checkout on another
//! branch does not lose its fixtures immediately.
//!
//! Sweeps are best effort: a failure on one entry is logged and the sweep
//! moves on.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::SnapshotError;
use crate::db::{Driver, DriverError};
use crate::fingerprint::{
    database_source_fragment, parse_snapshot_file_name, SnapshotName, SOURCE_HASH_LENGTH,
};
use crate::reuse::ReuseRecord;

/// What to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeOptions {
    /// Minimum time since last use before a stale entry is removed.
    pub grace_period: Duration,
    /// Remove entries matching the current sources too.
    pub include_current: bool,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(4 * 60 * 60),
            include_current: false,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

impl PurgeReport {
    /// Some entries could not be removed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn merge(&mut self, other: Self) {
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
    }
}

/// One snapshot file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub name: SnapshotName,
    pub size: u64,
    pub modified: SystemTime,
}

/// Snapshot files in `directory` carrying `prefix`, sorted by file name.
///
/// A missing directory has no snapshots.
pub fn list_snapshots(directory: &Path, prefix: &str) -> Result<Vec<SnapshotInfo>, SnapshotError> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: directory.to_path_buf(),
                source,
            })
        }
    };

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry in {}: {e}", directory.display());
                continue;
            }
        };
        let path = entry.path();
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| parse_snapshot_file_name(prefix, n))
        else {
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                log::warn!("Could not stat {}: {e}", path.display());
                continue;
            }
        };
        snapshots.push(SnapshotInfo {
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
            name,
        });
    }
    snapshots.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(snapshots)
}

fn source_fragment(source_hash: &str) -> &str {
    source_hash.get(..SOURCE_HASH_LENGTH).unwrap_or(source_hash)
}

/// Delete snapshots built from other sources once their grace period has
/// passed.
pub fn purge_stale_snapshots(
    directory: &Path,
    prefix: &str,
    current_source_hash: &str,
    options: PurgeOptions,
    now: SystemTime,
) -> Result<PurgeReport, SnapshotError> {
    let current = source_fragment(current_source_hash);
    let mut report = PurgeReport::default();

    for snapshot in list_snapshots(directory, prefix)? {
        let stale = options.include_current || snapshot.name.source != current;
        let idle = now
            .duration_since(snapshot.modified)
            .unwrap_or(Duration::ZERO);
        if !stale || idle < options.grace_period {
            continue;
        }
        let label = snapshot.path.display().to_string();
        match fs::remove_file(&snapshot.path) {
            Ok(()) => {
                log::info!("Removed stale snapshot {label}");
                report.removed.push(label);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Stale snapshot {label} already gone");
                report.removed.push(label);
            }
            Err(e) => {
                log::warn!("Could not remove stale snapshot {label}: {e}");
                report.failed.push(label);
            }
        }
    }
    Ok(report)
}

/// Drop this project's scenario databases that are stale and idle.
///
/// The driver is switched back to its previous database afterwards.
pub fn purge_stale_databases(
    driver: &mut dyn Driver,
    prefix: &str,
    project_name: &str,
    current_source_hash: &str,
    options: PurgeOptions,
    now: DateTime<Utc>,
) -> Result<PurgeReport, DriverError> {
    let previous = driver.current_database().map(ToString::to_string);
    let grace = chrono::Duration::from_std(options.grace_period)
        .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    let mut report = PurgeReport::default();

    for name in driver.list_databases()? {
        let ours = database_source_fragment(prefix, &name).is_some();
        if !ours || previous.as_deref() == Some(name.as_str()) {
            continue;
        }
        if let Err(e) = driver.use_database(&name) {
            log::warn!("Could not inspect database {name}: {e}");
            report.failed.push(name);
            continue;
        }
        let record = match ReuseRecord::load(driver) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("Could not read reuse record of {name}: {e}");
                continue;
            }
        };
        if record.project_name != project_name {
            continue;
        }
        let stale = options.include_current
            || !record.is_compatible()
            || record.build_checksum != current_source_hash;
        if !stale || now.signed_duration_since(record.last_used) < grace {
            continue;
        }

        match driver.drop_database(&name) {
            Ok(()) => {
                log::info!("Dropped stale database {name}");
                report.removed.push(name);
            }
            Err(e) => {
                log::warn!("Could not drop stale database {name}: {e}");
                report.failed.push(name);
            }
        }
    }

    if let Some(previous) = previous {
        driver.use_database(&previous)?;
    }
    Ok(report)
}
