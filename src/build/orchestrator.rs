//! The build orchestrator.
//!
//! One [`BuildOrchestrator`] resolves one logical connection to a fixture
//! database:
//!
//! 1. fingerprint the sources and the scenario, and derive the database name
//! 2. return early when this process already resolved the same database
//! 3. sweep stale databases and snapshots, once per connection
//! 4. delegate to a remote peer, or decide locally whether the existing
//!    database can be reused
//! 5. otherwise build it: create, write a provisional record, restore the
//!    best snapshot or run imports, migrations and seeders, take snapshots
//!    at the configured checkpoints, write the final record
//!
//! Around each test, [`BuildOrchestrator::run_post_build_steps`] opens the
//! wrapping transaction or arms the change journal, and
//! [`BuildOrchestrator::run_post_test_steps`] undoes whatever the test did.

use std::time::SystemTime;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::decision::{decide, Decision, DecisionInputs};
use super::remote::{self, RemoteBuildPeer, RemoteBuildRequest, RemoteBuildResponse, RemoteError};
use super::steps::{MigrationRunner, SeedRunner};
use super::{BuildError, BuildSettings};
use crate::cache::EngineCache;
use crate::db::Driver;
use crate::fingerprint::{database_name, Fingerprinter};
use crate::journal::{ChangeJournal, ReverseSummary};
use crate::reuse::{RecordError, ReuseRecord};
use crate::snapshot::{purge_stale_databases, purge_stale_snapshots, SnapshotStore};
use crate::transaction::TransactionGuard;

/// How a database came to be ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedVia {
    FreshBuild,
    /// Restored from a snapshot; `seeders_run` ran on top of it.
    Snapshot { seeders_run: Vec<String> },
    ReuseTransaction,
    ReuseJournal,
    /// Built by a remote peer.
    Remote,
}

/// A database ready for tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDatabase {
    pub database: String,
    pub host: String,
    pub build_checksum: String,
    pub scenario_checksum: String,
    pub transaction_reusable: bool,
    pub journal_reusable: bool,
    pub via: ResolvedVia,
}

/// The reuse strategy armed for the current test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveReuse {
    Transaction,
    Journal,
}

/// What undoing one test found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostTestReport {
    /// The wrapping transaction was committed by the test.
    pub transaction_committed: bool,
    /// Changes reversed by the journal, when it was armed.
    pub journal: Option<ReverseSummary>,
}

pub struct BuildOrchestrator<'a> {
    settings: BuildSettings,
    driver: &'a mut dyn Driver,
    migrations: &'a mut dyn MigrationRunner,
    seeds: &'a mut dyn SeedRunner,
    remote: Option<&'a dyn RemoteBuildPeer>,
    executed: bool,
    resolved: Option<ResolvedDatabase>,
    active: Option<ActiveReuse>,
}

impl<'a> BuildOrchestrator<'a> {
    pub fn new(
        settings: BuildSettings,
        driver: &'a mut dyn Driver,
        migrations: &'a mut dyn MigrationRunner,
        seeds: &'a mut dyn SeedRunner,
    ) -> Self {
        Self {
            settings,
            driver,
            migrations,
            seeds,
            remote: None,
            executed: false,
            resolved: None,
            active: None,
        }
    }

    /// Delegate builds to `peer` when `remote_build` is set.
    #[must_use]
    pub fn with_remote(mut self, peer: &'a dyn RemoteBuildPeer) -> Self {
        self.remote = Some(peer);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    #[must_use]
    pub fn resolved(&self) -> Option<&ResolvedDatabase> {
        self.resolved.as_ref()
    }

    /// The driver, pointed at the resolved database once executed.
    #[must_use]
    pub fn driver(&self) -> &dyn Driver {
        &*self.driver
    }

    /// Resolve the fixture database, building it when needed. Can only be
    /// called once.
    pub fn execute(&mut self, cache: &mut EngineCache) -> Result<ResolvedDatabase, BuildError> {
        if self.executed {
            return Err(BuildError::AlreadyExecuted);
        }
        self.executed = true;
        let resolved = self.resolve(cache)?;
        self.resolved = Some(resolved.clone());
        Ok(resolved)
    }

    fn resolve(&mut self, cache: &mut EngineCache) -> Result<ResolvedDatabase, BuildError> {
        let fingerprinter = Fingerprinter::new(self.settings.fingerprint.clone());
        let source_hash = fingerprinter.source_files_hash(cache)?;
        let scenario_hash = fingerprinter.cached_scenario_hash(cache, &self.settings.seeders);

        let name = database_name(
            &self.settings.fingerprint.prefix,
            &self.settings.original_database,
            self.settings.modifier.as_deref(),
            &source_hash,
            &scenario_hash,
        );
        let max = self.driver.max_database_name_length();
        if name.len() > max {
            return Err(BuildError::DatabaseNameTooLong {
                length: name.len(),
                name,
                max,
            });
        }

        let host = self.driver.host();
        let cache_key = format!("{name}@{host}");
        if let Some(resolved) = cache.resolved(&cache_key).cloned() {
            log::debug!("Database {name} already resolved in this process");
            self.driver.use_database(&resolved.database)?;
            return Ok(resolved);
        }

        if self.settings.purge_stale && cache.mark_purged(&host) {
            self.purge_stale(&source_hash);
        }

        let resolved = match self.remote {
            Some(peer) if self.settings.remote_build => self.build_remotely(peer)?,
            _ => self.build_locally(&fingerprinter, name, source_hash, scenario_hash)?,
        };
        cache.remember_resolved(cache_key, resolved.clone());
        Ok(resolved)
    }

    fn purge_stale(&mut self, source_hash: &str) {
        let options = self.settings.purge_options();
        match purge_stale_databases(
            &mut *self.driver,
            &self.settings.fingerprint.prefix,
            &self.settings.project_name,
            source_hash,
            options,
            Utc::now(),
        ) {
            Ok(report) if !report.removed.is_empty() => {
                log::info!("Dropped {} stale database(s)", report.removed.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("Stale database sweep failed: {e}"),
        }

        if !self.driver.capabilities().snapshots {
            return;
        }
        match purge_stale_snapshots(
            &self.settings.snapshot_directory,
            &self.settings.snapshot_prefix,
            source_hash,
            options,
            SystemTime::now(),
        ) {
            Ok(report) if !report.removed.is_empty() => {
                log::info!("Removed {} stale snapshot(s)", report.removed.len());
            }
            Ok(_) => {}
            Err(e) => log::warn!("Stale snapshot sweep failed: {e}"),
        }
    }

    fn build_remotely(
        &mut self,
        peer: &dyn RemoteBuildPeer,
    ) -> Result<ResolvedDatabase, BuildError> {
        let mut settings = self.settings.clone();
        settings.remote_build = false;
        let mut resolved = remote::request_build(peer, &settings)?;
        log::info!(
            "Remote peer resolved database {} on {}",
            resolved.database,
            resolved.host
        );
        self.driver.use_database(&resolved.database)?;
        resolved.via = ResolvedVia::Remote;
        Ok(resolved)
    }

    fn build_locally(
        &mut self,
        fingerprinter: &Fingerprinter,
        name: String,
        source_hash: String,
        scenario_hash: String,
    ) -> Result<ResolvedDatabase, BuildError> {
        let record = if self.driver.database_exists(&name)? {
            self.driver.use_database(&name)?;
            match ReuseRecord::load(&*self.driver) {
                Err(RecordError::Empty { database }) => {
                    log::warn!("Database {database} has an empty reuse table; rebuilding it");
                    None
                }
                loaded => loaded?,
            }
        } else {
            None
        };

        let inputs = DecisionInputs {
            database: &name,
            project_name: &self.settings.project_name,
            build_checksum: &source_hash,
            scenario_checksum: &scenario_hash,
            want_transactions: self.settings.reuse.transactions,
            want_journal: self.settings.reuse.journals,
            force_rebuild: self.settings.force_rebuild,
            is_browser_test: self.settings.is_browser_test,
            capabilities: self.driver.capabilities(),
        };
        let decision = decide(&inputs, record.as_ref())?;
        let mut transaction_reusable = inputs.transaction_reusable();
        let journal_reusable = inputs.journal_reusable();

        let via = match decision {
            Decision::ReuseTransaction => {
                log::info!("Reusing database {name} with a wrapping transaction");
                ReuseRecord::touch(self.driver.connection()?)?;
                ResolvedVia::ReuseTransaction
            }
            Decision::ReuseJournal => {
                log::info!("Reusing database {name} with the change journal");
                ReuseRecord::touch(self.driver.connection()?)?;
                transaction_reusable = false;
                ResolvedVia::ReuseJournal
            }
            Decision::FreshBuild(reason) => {
                log::info!("Building database {name}: {reason}");
                self.fresh_build(
                    fingerprinter,
                    &name,
                    &source_hash,
                    &scenario_hash,
                    transaction_reusable,
                    journal_reusable,
                )?
            }
        };

        Ok(ResolvedDatabase {
            database: name,
            host: self.driver.host(),
            build_checksum: source_hash,
            scenario_checksum: scenario_hash,
            transaction_reusable,
            journal_reusable,
            via,
        })
    }

    fn fresh_build(
        &mut self,
        fingerprinter: &Fingerprinter,
        name: &str,
        source_hash: &str,
        scenario_hash: &str,
        transaction_reusable: bool,
        journal_reusable: bool,
    ) -> Result<ResolvedVia, BuildError> {
        self.driver.create_database(name)?;
        let provisional = ReuseRecord::provisional(
            &self.settings.project_name,
            &self.settings.original_database,
            source_hash,
            scenario_hash,
        );
        provisional.save(self.driver.connection()?)?;

        let seeders = self.settings.seeders.clone();
        let checkpoints = self.settings.snapshots;
        let snapshots = self.driver.capabilities().snapshots && checkpoints.any();
        let store = SnapshotStore::new(
            &self.settings.snapshot_directory,
            &self.settings.snapshot_prefix,
            &self.settings.original_database,
            source_hash,
            fingerprinter.clone(),
        );

        let restored = if snapshots {
            store.try_restore(&mut *self.driver, &seeders)?
        } else {
            None
        };

        let via = match restored {
            Some(snapshot) => {
                // Snapshots are taken without the record.
                provisional.save(self.driver.connection()?)?;
                if !snapshot.seeders_to_run.is_empty() {
                    self.run_seeders(&snapshot.seeders_to_run)?;
                    if checkpoints.after_seeders {
                        store.take(&mut *self.driver, &seeders)?;
                    }
                }
                ResolvedVia::Snapshot {
                    seeders_run: snapshot.seeders_to_run,
                }
            }
            None => {
                self.run_imports(fingerprinter)?;
                if let Some(path) = &self.settings.fingerprint.migrations {
                    let path = fingerprinter.resolve_path(path);
                    log::debug!("Running migrations from {}", path.display());
                    self.migrations
                        .run(&mut *self.driver, &path)
                        .map_err(BuildError::Migration)?;
                }
                if snapshots && checkpoints.after_migrations {
                    store.take(&mut *self.driver, &[])?;
                }
                if !seeders.is_empty() {
                    self.run_seeders(&seeders)?;
                }
                let same_as_migrations = seeders.is_empty() && checkpoints.after_migrations;
                if snapshots && checkpoints.after_seeders && !same_as_migrations {
                    store.take(&mut *self.driver, &seeders)?;
                }
                ResolvedVia::FreshBuild
            }
        };

        let mut record = provisional;
        record.transaction_reusable = transaction_reusable;
        record.journal_reusable = journal_reusable;
        record.snapshot_checksum = snapshots.then(|| fingerprinter.snapshot_hash(&seeders));
        record.last_used = Utc::now();
        record.save(self.driver.connection()?)?;
        Ok(via)
    }

    fn run_imports(&mut self, fingerprinter: &Fingerprinter) -> Result<(), BuildError> {
        for import in &self.settings.fingerprint.imports {
            let path = fingerprinter.resolve_path(import);
            log::debug!("Importing {}", path.display());
            self.driver
                .import_sql_file(&path)
                .map_err(|source| BuildError::Import { path, source })?;
        }
        Ok(())
    }

    fn run_seeders(&mut self, seeders: &[String]) -> Result<(), BuildError> {
        log::debug!("Running seeders: {}", seeders.join(", "));
        self.seeds
            .run(&mut *self.driver, seeders)
            .map_err(BuildError::Seeding)
    }

    /// Arm the reuse strategy for the next test: the wrapping transaction
    /// when possible, otherwise the change journal.
    pub fn run_post_build_steps(&mut self) -> Result<Option<ActiveReuse>, BuildError> {
        let resolved = self.resolved.as_ref().ok_or(BuildError::NotExecuted)?;
        if self.active.is_some() {
            return Ok(self.active);
        }

        let active = if resolved.transaction_reusable {
            TransactionGuard::new(&*self.driver)?.start()?;
            Some(ActiveReuse::Transaction)
        } else if resolved.journal_reusable {
            let journal = ChangeJournal::new(&*self.driver)?;
            // Dirty first: a set-up that dies halfway forces a rebuild.
            journal.record_start()?;
            journal.set_up()?;
            Some(ActiveReuse::Journal)
        } else {
            None
        };
        self.active = active;
        Ok(active)
    }

    /// Undo the test's changes and leave the record ready for the next run.
    ///
    /// A committed wrapping transaction is reported and logged, not raised;
    /// the record keeps `inside_transaction` set so the next run rebuilds.
    pub fn run_post_test_steps(&mut self) -> Result<PostTestReport, BuildError> {
        if self.resolved.is_none() {
            return Err(BuildError::NotExecuted);
        }
        let mut report = PostTestReport::default();
        match self.active.take() {
            Some(ActiveReuse::Transaction) => {
                let mut guard = TransactionGuard::attach(&*self.driver)?;
                guard.rollback()?;
                report.transaction_committed = guard.was_committed()?;
            }
            Some(ActiveReuse::Journal) => {
                report.journal = Some(ChangeJournal::new(&*self.driver)?.reverse()?);
            }
            None => {}
        }
        ReuseRecord::touch(self.driver.connection()?)?;
        Ok(report)
    }
}

/// Serve a [`RemoteBuildRequest`] by running the build here.
///
/// Build failures travel back inside the response; only an unreadable or
/// incompatible request is an error on this side.
pub fn handle_remote_request(
    payload: &str,
    driver: &mut dyn Driver,
    migrations: &mut dyn MigrationRunner,
    seeds: &mut dyn SeedRunner,
    cache: &mut EngineCache,
) -> Result<String, RemoteError> {
    let request = RemoteBuildRequest::decode(payload)?;
    let mut settings = request.settings;
    settings.remote_build = false;

    let result = BuildOrchestrator::new(settings, driver, migrations, seeds)
        .execute(cache)
        .map_err(|e| {
            log::error!("Remote build failed: {e}");
            e.to_string()
        });
    RemoteBuildResponse::new(result).encode()
}
