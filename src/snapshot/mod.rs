//! Whole-database snapshots keyed by fingerprint.
//!
//! A snapshot captures the database after migrations (no seeders) or after
//! some prefix of the seeder list. Lookup starts with the full seeder list
//! and drops seeders from the end until a snapshot file exists; the dropped
//! seeders are returned so the caller can run them on top.
//!
//! The reuse record is removed while dumping so that a snapshot's content
//! only depends on what built it.

pub mod purge;

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::db::{Driver, DriverError};
use crate::fingerprint::{snapshot_file_name, Fingerprinter};
use crate::reuse::{RecordError, ReuseRecord};

pub use purge::{
    list_snapshots, purge_stale_databases, purge_stale_snapshots, PurgeOptions, PurgeReport,
    SnapshotInfo,
};

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("could not export snapshot {path}: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: DriverError,
    },

    #[error("could not import snapshot {path}: {source}")]
    Import {
        path: PathBuf,
        #[source]
        source: DriverError,
    },

    #[error("snapshot I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// A snapshot that was imported, and the seeders still to run on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredSnapshot {
    pub path: PathBuf,
    /// Seeders contained in the snapshot.
    pub seeders_restored: Vec<String>,
    /// Seeders missing from the snapshot, in their original order.
    pub seeders_to_run: Vec<String>,
}

/// Snapshot files of one original database.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    directory: PathBuf,
    prefix: String,
    original: String,
    source_hash: String,
    fingerprinter: Fingerprinter,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(
        directory: impl Into<PathBuf>,
        prefix: &str,
        original: &str,
        source_hash: &str,
        fingerprinter: Fingerprinter,
    ) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.to_string(),
            original: original.to_string(),
            source_hash: source_hash.to_string(),
            fingerprinter,
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the snapshot containing exactly `seeders`.
    #[must_use]
    pub fn snapshot_path(&self, seeders: &[String], extension: &str) -> PathBuf {
        self.directory.join(snapshot_file_name(
            &self.prefix,
            &self.original,
            &self.source_hash,
            &self.fingerprinter.snapshot_hash(seeders),
            extension,
        ))
    }

    /// Dump the current database as the snapshot for `seeders`.
    ///
    /// The reuse record is put back even when the dump fails.
    pub fn take(
        &self,
        driver: &mut dyn Driver,
        seeders: &[String],
    ) -> Result<PathBuf, SnapshotError> {
        let path = self.snapshot_path(seeders, driver.snapshot_extension());
        fs::create_dir_all(&self.directory).map_err(|source| SnapshotError::Io {
            path: self.directory.clone(),
            source,
        })?;

        let record = ReuseRecord::load(driver)?;
        if record.is_some() {
            ReuseRecord::remove(driver.connection()?)?;
        }

        let exported = self.export_to(driver, &path);

        if let Some(record) = &record {
            record.save(driver.connection()?)?;
        }
        exported?;

        log::info!(
            "Snapshot taken: {} ({} seeder(s))",
            path.display(),
            seeders.len()
        );
        Ok(path)
    }

    fn export_to(&self, driver: &mut dyn Driver, path: &Path) -> Result<(), SnapshotError> {
        // Dump next to the target and rename, so readers never see a
        // partial file.
        let partial = path.with_extension(format!("{}.partial", driver.snapshot_extension()));
        if let Err(source) = driver.export_snapshot(&partial) {
            let _ = fs::remove_file(&partial);
            return Err(SnapshotError::Export {
                path: path.to_path_buf(),
                source,
            });
        }
        fs::rename(&partial, path).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Import the snapshot covering the longest prefix of `seeders`.
    ///
    /// Returns `None` when not even the no-seeder snapshot exists.
    pub fn try_restore(
        &self,
        driver: &mut dyn Driver,
        seeders: &[String],
    ) -> Result<Option<RestoredSnapshot>, SnapshotError> {
        let extension = driver.snapshot_extension();
        for kept in (0..=seeders.len()).rev() {
            let subset = &seeders[..kept];
            let path = self.snapshot_path(subset, extension);
            if !path.is_file() {
                log::debug!("No snapshot at {}", path.display());
                continue;
            }

            driver
                .import_snapshot(&path)
                .map_err(|source| SnapshotError::Import {
                    path: path.clone(),
                    source,
                })?;
            if let Err(e) = filetime::set_file_mtime(&path, FileTime::now()) {
                log::warn!("Could not refresh mtime of {}: {e}", path.display());
            }

            log::info!(
                "Restored snapshot {} ({} of {} seeder(s))",
                path.display(),
                kept,
                seeders.len()
            );
            return Ok(Some(RestoredSnapshot {
                path,
                seeders_restored: subset.to_vec(),
                seeders_to_run: seeders[kept..].to_vec(),
            }));
        }
        Ok(None)
    }
}
