//! Shared fixtures: a journaling SQLite driver and project scaffolding.

use dbfixture::build::{BuildSettings, StepError};
use dbfixture::db::{
    quote_identifier, Capabilities, Connection, Driver, DriverError, DriverKind, DriverResult,
    SqlValue, SqliteDriver,
};
use dbfixture::journal::{
    new_key_column, JournalDialect, JournalError, TriggerSpec, ACTION_COLUMN, ID_COLUMN,
    TRACKER_COLUMN,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Trigger dialect for SQLite, only used to exercise the journal in tests.
#[derive(Debug, Default)]
pub struct SqliteJournalDialect;

impl JournalDialect for SqliteJournalDialect {
    fn columns(&self, conn: &dyn Connection, table: &str) -> Result<Vec<String>, DriverError> {
        Ok(conn
            .select(
                "SELECT name FROM pragma_table_info(?) ORDER BY cid",
                &[SqlValue::from(table)],
            )?
            .iter()
            .filter_map(|row| row.get("name").and_then(SqlValue::to_text))
            .collect())
    }

    fn unique_key(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<Vec<String>>, DriverError> {
        let key: Vec<String> = conn
            .select(
                "SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk",
                &[SqlValue::from(table)],
            )?
            .iter()
            .filter_map(|row| row.get("name").and_then(SqlValue::to_text))
            .collect();
        Ok((!key.is_empty()).then_some(key))
    }

    fn tracker_table_ddl(&self, tracker_table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT NOT NULL PRIMARY KEY)",
            quote_identifier(tracker_table),
            quote_identifier(TRACKER_COLUMN)
        )
    }

    fn journal_table_ddl(
        &self,
        conn: &dyn Connection,
        table: &str,
        journal_table: &str,
        key: &[String],
    ) -> Result<String, JournalError> {
        let mut columns = vec![
            format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_identifier(ID_COLUMN)),
            format!("{} TEXT NOT NULL", quote_identifier(ACTION_COLUMN)),
        ];
        columns.extend(self.columns(conn, table)?.iter().map(|c| quote_identifier(c)));
        columns.extend((0..key.len()).map(|position| quote_identifier(&new_key_column(position))));
        Ok(format!(
            "CREATE TABLE {} ({})",
            quote_identifier(journal_table),
            columns.join(", ")
        ))
    }

    fn trigger_ddl(&self, spec: &TriggerSpec<'_>) -> String {
        let (columns, values) = spec.recorded_values();
        format!(
            "CREATE TRIGGER {} AFTER {} ON {} FOR EACH ROW BEGIN \
             INSERT INTO {} ({}) VALUES ({}); \
             INSERT OR IGNORE INTO {} ({}) VALUES ({}); END",
            quote_identifier(&spec.trigger_name()),
            spec.action.as_str(),
            quote_identifier(spec.table),
            quote_identifier(spec.journal_table),
            columns.join(", "),
            values.join(", "),
            quote_identifier(spec.tracker_table),
            quote_identifier(TRACKER_COLUMN),
            spec.table_literal(),
        )
    }

    fn triggers(&self, conn: &dyn Connection, table: &str) -> Result<Vec<String>, DriverError> {
        Ok(conn
            .select(
                "SELECT name FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?",
                &[SqlValue::from(table)],
            )?
            .iter()
            .filter_map(|row| row.get("name").and_then(SqlValue::to_text))
            .collect())
    }

    fn foreign_key_checks(&self, conn: &dyn Connection) -> Result<bool, DriverError> {
        Ok(conn
            .select("PRAGMA foreign_keys", &[])?
            .first()
            .and_then(|row| row.get_index(0))
            .and_then(SqlValue::as_bool)
            .unwrap_or(false))
    }

    fn set_foreign_key_checks(
        &self,
        conn: &dyn Connection,
        enabled: bool,
    ) -> Result<(), DriverError> {
        conn.direct_exec(&format!("PRAGMA foreign_keys = {}", u8::from(enabled)))
    }

    fn truncate_sql(&self, table: &str) -> String {
        format!("DELETE FROM {}", quote_identifier(table))
    }
}

/// [`SqliteDriver`] with trigger journaling switched on.
pub struct JournalingSqlite {
    inner: SqliteDriver,
    dialect: SqliteJournalDialect,
}

impl JournalingSqlite {
    pub fn new(directory: &Path) -> Self {
        Self {
            inner: SqliteDriver::new(directory),
            dialect: SqliteJournalDialect,
        }
    }
}

impl Driver for JournalingSqlite {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            journaling: true,
            ..self.inner.capabilities()
        }
    }

    fn connection(&self) -> DriverResult<&dyn Connection> {
        self.inner.connection()
    }

    fn journal_dialect(&self) -> Option<&dyn JournalDialect> {
        Some(&self.dialect)
    }

    fn max_database_name_length(&self) -> usize {
        self.inner.max_database_name_length()
    }

    fn snapshot_extension(&self) -> &'static str {
        self.inner.snapshot_extension()
    }

    fn current_database(&self) -> Option<&str> {
        self.inner.current_database()
    }

    fn use_database(&mut self, name: &str) -> DriverResult<()> {
        self.inner.use_database(name)
    }

    fn list_databases(&self) -> DriverResult<Vec<String>> {
        self.inner.list_databases()
    }

    fn database_exists(&self, name: &str) -> DriverResult<bool> {
        self.inner.database_exists(name)
    }

    fn create_database(&mut self, name: &str) -> DriverResult<()> {
        self.inner.create_database(name)
    }

    fn drop_database(&mut self, name: &str) -> DriverResult<()> {
        self.inner.drop_database(name)
    }

    fn list_tables(&self) -> DriverResult<Vec<String>> {
        self.inner.list_tables()
    }

    fn export_snapshot(&mut self, path: &Path) -> DriverResult<()> {
        self.inner.export_snapshot(path)
    }

    fn import_snapshot(&mut self, path: &Path) -> DriverResult<()> {
        self.inner.import_snapshot(path)
    }

    fn import_sql_file(&mut self, path: &Path) -> DriverResult<()> {
        self.inner.import_sql_file(path)
    }

    fn host(&self) -> String {
        self.inner.host()
    }
}

/// A project checkout with one migration file, plus sibling directories for
/// databases and snapshots.
pub struct Project {
    pub root: PathBuf,
    pub databases: PathBuf,
    pub snapshots: PathBuf,
}

impl Project {
    pub fn new(base: &Path) -> Self {
        let root = base.join("project");
        fs::create_dir_all(root.join("migrations")).unwrap();
        fs::write(
            root.join("migrations").join("001_users.sql"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        )
        .unwrap();
        Self {
            root,
            databases: base.join("databases"),
            snapshots: base.join("snapshots"),
        }
    }

    pub fn settings(&self) -> BuildSettings {
        let mut settings = BuildSettings {
            project_name: "shop".to_string(),
            snapshot_directory: self.snapshots.clone(),
            purge_stale: false,
            ..BuildSettings::default()
        };
        settings.fingerprint.project_root = self.root.clone();
        settings.fingerprint.migrations = Some(PathBuf::from("migrations"));
        settings
    }
}

/// Applies every `.sql` file of the migrations directory, in name order.
#[derive(Debug, Default)]
pub struct SqlMigrations {
    pub runs: usize,
}

impl dbfixture::build::MigrationRunner for SqlMigrations {
    fn run(&mut self, driver: &mut dyn Driver, path: &Path) -> Result<(), StepError> {
        self.runs += 1;
        let mut files: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "sql"))
            .collect();
        files.sort();
        for file in files {
            driver.connection()?.direct_exec(&fs::read_to_string(file)?)?;
        }
        Ok(())
    }
}

/// Inserts one user per seeder, named after the seeder.
#[derive(Debug, Default)]
pub struct UserSeeds {
    pub ran: Vec<String>,
}

impl dbfixture::build::SeedRunner for UserSeeds {
    fn run(&mut self, driver: &mut dyn Driver, seeders: &[String]) -> Result<(), StepError> {
        for seeder in seeders {
            driver.connection()?.insert(
                "INSERT INTO users (name) VALUES (?)",
                &[SqlValue::from(seeder.as_str())],
            )?;
            self.ran.push(seeder.clone());
        }
        Ok(())
    }
}

/// Names in the `users` table, sorted.
pub fn user_names(driver: &dyn Driver) -> Vec<String> {
    driver
        .connection()
        .unwrap()
        .select("SELECT name FROM users ORDER BY name", &[])
        .unwrap()
        .iter()
        .filter_map(|row| row.get("name").and_then(SqlValue::to_text))
        .collect()
}
