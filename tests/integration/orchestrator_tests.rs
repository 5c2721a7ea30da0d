use super::support::{user_names, JournalingSqlite, Project, SqlMigrations, UserSeeds};
use dbfixture::build::{
    handle_remote_request, ActiveReuse, BuildError, BuildOrchestrator, BuildSettings,
    RemoteBuildPeer, RemoteError, ResolvedDatabase, ResolvedVia, StepError,
};
use dbfixture::cache::EngineCache;
use dbfixture::db::{Driver, SqliteDriver};
use dbfixture::build::MigrationRunner;
use dbfixture::reuse::{ReuseRecord, REUSE_TABLE};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

/// One test run in a fresh process: new driver, new cache.
fn run_once(
    project: &Project,
    settings: BuildSettings,
    migrations: &mut SqlMigrations,
    seeds: &mut UserSeeds,
) -> ResolvedDatabase {
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();
    let mut build = BuildOrchestrator::new(settings, &mut driver, migrations, seeds);
    let resolved = build.execute(&mut cache).unwrap();
    assert_eq!(build.run_post_build_steps().unwrap(), Some(ActiveReuse::Transaction));
    build
        .driver()
        .connection()
        .unwrap()
        .insert("INSERT INTO users (name) VALUES ('temp')", &[])
        .unwrap();
    let report = build.run_post_test_steps().unwrap();
    assert!(!report.transaction_committed);
    resolved
}

#[test]
fn test_second_run_reuses_without_migrating() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut settings = project.settings();
    settings.seeders = vec!["alice".to_string()];
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();

    let first = run_once(&project, settings.clone(), &mut migrations, &mut seeds);
    assert_eq!(first.via, ResolvedVia::FreshBuild);
    assert!(first.database.starts_with("test_app_"));
    assert!(first.transaction_reusable);

    let second = run_once(&project, settings, &mut migrations, &mut seeds);
    assert_eq!(second.via, ResolvedVia::ReuseTransaction);
    assert_eq!(second.database, first.database);
    assert_eq!(migrations.runs, 1);
    assert_eq!(seeds.ran, vec!["alice".to_string()]);

    let mut driver = SqliteDriver::new(&project.databases);
    driver.use_database(&first.database).unwrap();
    assert_eq!(user_names(&driver), vec!["alice".to_string()]);
}

#[test]
fn test_changed_migration_builds_new_database() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();

    let first = run_once(&project, project.settings(), &mut migrations, &mut seeds);
    std::fs::write(
        project.root.join("migrations").join("002_index.sql"),
        "CREATE INDEX users_name ON users (name);",
    )
    .unwrap();
    let second = run_once(&project, project.settings(), &mut migrations, &mut seeds);

    assert_ne!(first.database, second.database);
    assert_ne!(first.build_checksum, second.build_checksum);
    assert_eq!(first.scenario_checksum, second.scenario_checksum);
    assert_eq!(second.via, ResolvedVia::FreshBuild);
    assert_eq!(migrations.runs, 2);
}

#[test]
fn test_committed_transaction_forces_rebuild() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();

    {
        let mut driver = SqliteDriver::new(&project.databases);
        let mut cache = EngineCache::new();
        let mut build =
            BuildOrchestrator::new(project.settings(), &mut driver, &mut migrations, &mut seeds);
        build.execute(&mut cache).unwrap();
        build.run_post_build_steps().unwrap();
        let conn = build.driver().connection().unwrap();
        conn.direct_exec("INSERT INTO users (name) VALUES ('leaked'); COMMIT; BEGIN;")
            .unwrap();
        let report = build.run_post_test_steps().unwrap();
        assert!(report.transaction_committed);
    }

    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();
    let mut build =
        BuildOrchestrator::new(project.settings(), &mut driver, &mut migrations, &mut seeds);
    let resolved = build.execute(&mut cache).unwrap();
    assert_eq!(resolved.via, ResolvedVia::FreshBuild);
    assert!(user_names(build.driver()).is_empty());
    drop(build);
    assert_eq!(migrations.runs, 2);
}

#[test]
fn test_journal_reuse_reverses_test_changes() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut settings = project.settings();
    settings.reuse.transactions = false;
    settings.reuse.journals = true;
    settings.seeders = vec!["bob".to_string()];
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();

    for expected in [ResolvedVia::FreshBuild, ResolvedVia::ReuseJournal] {
        let mut driver = JournalingSqlite::new(&project.databases);
        let mut cache = EngineCache::new();
        let mut build =
            BuildOrchestrator::new(settings.clone(), &mut driver, &mut migrations, &mut seeds);
        let resolved = build.execute(&mut cache).unwrap();
        assert_eq!(resolved.via, expected);
        assert!(!resolved.transaction_reusable);
        assert!(resolved.journal_reusable);

        assert_eq!(build.run_post_build_steps().unwrap(), Some(ActiveReuse::Journal));
        let conn = build.driver().connection().unwrap();
        conn.insert("INSERT INTO users (name) VALUES ('carol')", &[])
            .unwrap();
        conn.update("UPDATE users SET name = 'robert' WHERE name = 'bob'", &[])
            .unwrap();

        let report = build.run_post_test_steps().unwrap();
        let journal = report.journal.unwrap();
        assert_eq!(journal.tables, vec!["users".to_string()]);
        assert_eq!(journal.rows, 2);
        assert_eq!(user_names(build.driver()), vec!["bob".to_string()]);
    }
    assert_eq!(migrations.runs, 1);
}

#[test]
fn test_foreign_project_database_is_refused() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let first = run_once(&project, project.settings(), &mut migrations, &mut seeds);

    // Rewrite the owner of the existing database.
    let mut driver = SqliteDriver::new(&project.databases);
    driver.use_database(&first.database).unwrap();
    let mut record = ReuseRecord::load(&driver).unwrap().unwrap();
    record.project_name = "billing".to_string();
    record.save(driver.connection().unwrap()).unwrap();

    let mut cache = EngineCache::new();
    let mut build =
        BuildOrchestrator::new(project.settings(), &mut driver, &mut migrations, &mut seeds);
    let err = build.execute(&mut cache).unwrap_err();
    assert!(matches!(err, BuildError::OwnershipConflict { ref owner, .. } if owner == "billing"));
}

#[test]
fn test_empty_reuse_table_is_rebuilt() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let first = run_once(&project, project.settings(), &mut migrations, &mut seeds);

    let mut driver = SqliteDriver::new(&project.databases);
    driver.use_database(&first.database).unwrap();
    driver
        .connection()
        .unwrap()
        .update(&format!("DELETE FROM `{REUSE_TABLE}`"), &[])
        .unwrap();
    drop(driver);

    let second = run_once(&project, project.settings(), &mut migrations, &mut seeds);
    assert_eq!(second.via, ResolvedVia::FreshBuild);
    assert_eq!(second.database, first.database);
    assert_eq!(migrations.runs, 2);
}

#[test]
fn test_provisional_record_exists_while_migrating() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut seen = None;
    let mut migrations = |driver: &mut dyn Driver, path: &Path| -> Result<(), StepError> {
        seen = ReuseRecord::load(&*driver).unwrap();
        SqlMigrations::default().run(driver, path)
    };
    let mut seeds = UserSeeds::default();
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();

    let resolved = BuildOrchestrator::new(project.settings(), &mut driver, &mut migrations, &mut seeds)
        .execute(&mut cache)
        .unwrap();

    let provisional = seen.unwrap();
    assert_eq!(provisional.project_name, "shop");
    assert_eq!(provisional.build_checksum, resolved.build_checksum);
    assert!(!provisional.transaction_reusable);
    assert!(!provisional.journal_reusable);
    assert!(!provisional.is_dirty());

    let last = ReuseRecord::load(&driver).unwrap().unwrap();
    assert!(last.transaction_reusable);
}

#[test]
fn test_overlong_database_name_is_configuration_error() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut settings = project.settings();
    settings.original_database = "a".repeat(260);
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();

    let err = BuildOrchestrator::new(settings, &mut driver, &mut migrations, &mut seeds)
        .execute(&mut cache)
        .unwrap_err();
    match &err {
        BuildError::DatabaseNameTooLong { name, length, max } => {
            assert_eq!(name.len(), *length);
            assert!(length > max);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_configuration_error());
    assert_eq!(migrations.runs, 0);
    assert!(driver.list_databases().unwrap().is_empty());
}

#[test]
fn test_execute_twice_fails() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();
    let mut build =
        BuildOrchestrator::new(project.settings(), &mut driver, &mut migrations, &mut seeds);

    assert!(matches!(
        build.run_post_build_steps(),
        Err(BuildError::NotExecuted)
    ));
    build.execute(&mut cache).unwrap();
    assert!(matches!(
        build.execute(&mut cache),
        Err(BuildError::AlreadyExecuted)
    ));
}

#[test]
fn test_same_process_reuses_cached_resolution() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();

    let first = BuildOrchestrator::new(project.settings(), &mut driver, &mut migrations, &mut seeds)
        .execute(&mut cache)
        .unwrap();
    let second =
        BuildOrchestrator::new(project.settings(), &mut driver, &mut migrations, &mut seeds)
            .execute(&mut cache)
            .unwrap();
    assert_eq!(first, second);
    assert_eq!(migrations.runs, 1);
    assert_eq!(driver.current_database(), Some(first.database.as_str()));
}

#[test]
fn test_missing_migrations_path_is_configuration_error() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut settings = project.settings();
    settings.fingerprint.migrations = Some(PathBuf::from("nope"));
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();

    let err = BuildOrchestrator::new(settings, &mut driver, &mut migrations, &mut seeds)
        .execute(&mut cache)
        .unwrap_err();
    assert!(err.is_configuration_error());
    assert!(driver.list_databases().unwrap().is_empty());
}

#[test]
fn test_seeder_failure_is_reported() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut settings = project.settings();
    settings.seeders = vec!["broken".to_string()];
    let mut migrations = SqlMigrations::default();
    let mut seeds = |_: &mut dyn Driver, _: &[String]| -> Result<(), StepError> {
        Err("seeder exploded".into())
    };
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();

    let err = BuildOrchestrator::new(settings, &mut driver, &mut migrations, &mut seeds)
        .execute(&mut cache)
        .unwrap_err();
    assert!(matches!(err, BuildError::Seeding(_)));
    assert!(err.to_string().contains("seeder exploded"));
}

/// Serves builds in-process over the remote payload format.
struct LocalPeer {
    databases: PathBuf,
    migrations: RefCell<SqlMigrations>,
}

impl RemoteBuildPeer for LocalPeer {
    fn send(&self, payload: &str) -> Result<String, RemoteError> {
        let mut driver = SqliteDriver::new(&self.databases);
        let mut seeds = UserSeeds::default();
        let mut cache = EngineCache::new();
        handle_remote_request(
            payload,
            &mut driver,
            &mut *self.migrations.borrow_mut(),
            &mut seeds,
            &mut cache,
        )
    }
}

#[test]
fn test_remote_build_is_used_when_enabled() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut settings = project.settings();
    settings.remote_build = true;
    let peer = LocalPeer {
        databases: project.databases.clone(),
        migrations: RefCell::new(SqlMigrations::default()),
    };
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();

    let resolved = BuildOrchestrator::new(settings, &mut driver, &mut migrations, &mut seeds)
        .with_remote(&peer)
        .execute(&mut cache)
        .unwrap();

    assert_eq!(resolved.via, ResolvedVia::Remote);
    assert_eq!(migrations.runs, 0);
    assert_eq!(peer.migrations.borrow().runs, 1);
    assert_eq!(driver.current_database(), Some(resolved.database.as_str()));
}

#[test]
fn test_remote_version_mismatch_is_rejected() {
    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();

    let payload = serde_json::json!({ "version": 99, "settings": {} }).to_string();
    let err = handle_remote_request(&payload, &mut driver, &mut migrations, &mut seeds, &mut cache)
        .unwrap_err();
    assert!(matches!(
        err,
        RemoteError::IncompatibleVersion { found: 99, .. }
    ));
    assert_eq!(migrations.runs, 0);
}

#[test]
fn test_remote_build_failure_travels_back() {
    struct FailingPeer(PathBuf);

    impl RemoteBuildPeer for FailingPeer {
        fn send(&self, payload: &str) -> Result<String, RemoteError> {
            let mut driver = SqliteDriver::new(&self.0);
            let mut migrations = SqlMigrations::default();
            let mut seeds = |_: &mut dyn Driver, _: &[String]| -> Result<(), StepError> {
                Err("no seeds here".into())
            };
            handle_remote_request(
                payload,
                &mut driver,
                &mut migrations,
                &mut seeds,
                &mut EngineCache::new(),
            )
        }
    }

    let dir = tempdir().unwrap();
    let project = Project::new(dir.path());
    let mut settings = project.settings();
    settings.seeders = vec!["alice".to_string()];
    settings.remote_build = true;
    let peer = FailingPeer(project.databases.clone());
    let mut migrations = SqlMigrations::default();
    let mut seeds = UserSeeds::default();
    let mut driver = SqliteDriver::new(&project.databases);
    let mut cache = EngineCache::new();

    let err = BuildOrchestrator::new(settings, &mut driver, &mut migrations, &mut seeds)
        .with_remote(&peer)
        .execute(&mut cache)
        .unwrap_err();
    match err {
        BuildError::Remote(RemoteError::Failed(message)) => {
            assert!(message.contains("no seeds here"));
        }
        other => panic!("expected a remote failure, got {other:?}"),
    }
    assert!(seeds.ran.is_empty());
}
