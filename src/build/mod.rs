//! Build orchestration: deciding whether a fixture database can be reused,
//! building it when it cannot, and wrapping each test in the chosen reuse
//! strategy.
//!
//! - [`decision`]: the pure reuse state machine
//! - [`orchestrator`]: [`BuildOrchestrator`], the build and post-test steps
//! - [`remote`]: delegating a build to another process
//! - [`steps`]: contracts for the external migration and seed runners

pub mod decision;
pub mod orchestrator;
pub mod remote;
pub mod steps;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::DriverError;
use crate::fingerprint::{FingerprintError, FingerprintSettings};
use crate::journal::JournalError;
use crate::reuse::RecordError;
use crate::snapshot::{PurgeOptions, SnapshotError};
use crate::transaction::TransactionError;

pub use decision::{decide, Decision, DecisionInputs, FreshReason};
pub use orchestrator::{
    handle_remote_request, ActiveReuse, BuildOrchestrator, PostTestReport, ResolvedDatabase,
    ResolvedVia,
};
pub use remote::{RemoteBuildPeer, RemoteError, REMOTE_PAYLOAD_VERSION};
pub use steps::{MigrationRunner, SeedRunner, StepError};

/// Which reuse strategies the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReuseSettings {
    pub transactions: bool,
    pub journals: bool,
}

impl Default for ReuseSettings {
    fn default() -> Self {
        Self {
            transactions: true,
            journals: false,
        }
    }
}

/// When snapshots are taken during a fresh build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotCheckpoints {
    pub after_migrations: bool,
    pub after_seeders: bool,
}

impl SnapshotCheckpoints {
    #[must_use]
    pub fn any(self) -> bool {
        self.after_migrations || self.after_seeders
    }
}

/// Everything one build needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Owner of the databases; a database owned by another project is never
    /// touched.
    pub project_name: String,
    /// Database name the application would normally use.
    pub original_database: String,
    /// Per-worker token keeping parallel workers on separate databases.
    pub modifier: Option<String>,
    pub fingerprint: FingerprintSettings,
    pub seeders: Vec<String>,
    pub reuse: ReuseSettings,
    pub snapshots: SnapshotCheckpoints,
    pub snapshot_directory: PathBuf,
    pub snapshot_prefix: String,
    pub force_rebuild: bool,
    pub is_browser_test: bool,
    /// Delegate the build to a remote peer when one is available.
    pub remote_build: bool,
    /// Sweep stale databases and snapshots once per connection.
    pub purge_stale: bool,
    pub grace_period_secs: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            original_database: "app".to_string(),
            modifier: None,
            fingerprint: FingerprintSettings {
                prefix: "test_".to_string(),
                check_for_source_changes: true,
                ..FingerprintSettings::default()
            },
            seeders: Vec::new(),
            reuse: ReuseSettings::default(),
            snapshots: SnapshotCheckpoints::default(),
            snapshot_directory: PathBuf::from(".dbfixture/snapshots"),
            snapshot_prefix: "snapshot_".to_string(),
            force_rebuild: false,
            is_browser_test: false,
            remote_build: false,
            purge_stale: true,
            grace_period_secs: PurgeOptions::default().grace_period.as_secs(),
        }
    }
}

impl BuildSettings {
    #[must_use]
    pub fn purge_options(&self) -> PurgeOptions {
        PurgeOptions {
            grace_period: Duration::from_secs(self.grace_period_secs),
            include_current: false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("database name {name} is {length} characters long, the driver allows {max}")]
    DatabaseNameTooLong {
        name: String,
        length: usize,
        max: usize,
    },

    /// The database exists and belongs to another project.
    #[error("database {database} belongs to project '{owner}', not '{project}'; refusing to touch it")]
    OwnershipConflict {
        database: String,
        owner: String,
        project: String,
    },

    #[error("this build has already been executed")]
    AlreadyExecuted,

    #[error("the build has not been executed yet")]
    NotExecuted,

    #[error("could not import {path}: {source}")]
    Import {
        path: PathBuf,
        #[source]
        source: DriverError,
    },

    #[error("migrations failed: {0}")]
    Migration(#[source] StepError),

    #[error("seeding failed: {0}")]
    Seeding(#[source] StepError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl BuildError {
    /// Errors caused by the build configuration rather than the database.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Fingerprint(_) | Self::DatabaseNameTooLong { .. })
    }
}
