//! Database access layer.
//!
//! Two seams live here:
//!
//! * [`Connection`]: a minimal statement executor (`select`, `insert`,
//!   `update`, `statement`, `direct_exec`). Anything that can run SQL
//!   against a server can implement it.
//! * [`Driver`]: a dialect adapter built on a connection. It owns database
//!   lifecycle (list/create/drop/switch), snapshot export/import and the
//!   wrapping transaction, and advertises what it can do through
//!   [`Capabilities`] instead of through a type hierarchy.
//!
//! Drivers:
//! - [`sqlite`]: file-per-database, snapshots by file copy, no journaling
//! - [`mysql`]: schema-per-database, dump/import snapshots, trigger journaling

pub mod mysql;
pub mod sqlite;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::journal::JournalDialect;

pub use mysql::{MysqlDriver, MysqlSettings};
pub use sqlite::{SqliteConnection, SqliteDriver};

/// A single SQL value as exchanged with a [`Connection`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Interpret the value as a boolean flag (`0`/`1`, `"0"`/`"1"`).
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Integer(i) => Some(*i != 0),
            Self::Real(f) => Some(*f != 0.0),
            Self::Text(s) => s.trim().parse::<i64>().ok().map(|i| i != 0),
            Self::Null | Self::Blob(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value as text, whatever its storage type.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Integer(i) => Some(i.to_string()),
            Self::Real(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One result row: column names paired with values, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    #[must_use]
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Look a value up by column name (case-insensitive).
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|i| &self.values[i])
    }

    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Iterate `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Errors raised by connections and drivers.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    /// A statement failed on the server.
    #[error("query failed: {message} (sql: {sql})")]
    Query { sql: String, message: String },

    /// The driver has no open connection (for example mid-copy).
    #[error("no database is selected on connection '{0}'")]
    NoDatabaseSelected(String),

    /// The database file or schema could not be found.
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// An external executable (dump/import client) could not be started.
    #[error("could not run {program}: {source}")]
    ToolUnavailable {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external executable ran but reported failure.
    #[error("{program} exited with status {status} while processing {path}: {stderr}")]
    ToolFailed {
        program: PathBuf,
        path: PathBuf,
        status: String,
        stderr: String,
    },

    /// The requested capability is not available on this driver.
    #[error("the {driver} driver does not support {feature}")]
    Unsupported {
        driver: DriverKind,
        feature: &'static str,
    },

    /// A filesystem operation on database or snapshot files failed.
    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// SQLite reported an error.
    #[error("sqlite error on {path}: {source}")]
    Sqlite {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

impl DriverError {
    /// Build a [`DriverError::Query`] from any displayable failure.
    pub fn query(sql: &str, message: impl fmt::Display) -> Self {
        Self::Query {
            sql: sql.to_string(),
            message: message.to_string(),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Minimal SQL executor the engine runs everything through.
///
/// Placeholders are positional `?`. `direct_exec` sends the text as-is
/// (no preparation) and may contain several statements.
pub trait Connection {
    /// Run a query and collect all rows.
    fn select(&self, sql: &str, params: &[SqlValue]) -> DriverResult<Vec<Row>>;

    /// Run an INSERT; returns the number of affected rows.
    fn insert(&self, sql: &str, params: &[SqlValue]) -> DriverResult<u64>;

    /// Run an UPDATE or DELETE; returns the number of affected rows.
    fn update(&self, sql: &str, params: &[SqlValue]) -> DriverResult<u64>;

    /// Run any other prepared statement.
    fn statement(&self, sql: &str, params: &[SqlValue]) -> DriverResult<()>;

    /// Execute unprepared SQL (DDL, trigger bodies, transaction control).
    fn direct_exec(&self, sql: &str) -> DriverResult<()>;
}

/// The database engines the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Sqlite,
    Mysql,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Mysql => write!(f, "mysql"),
        }
    }
}

/// What a driver can do. The orchestrator only consults these flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Databases may be reused between runs at all.
    pub reuse: bool,
    /// A wrapping transaction can be started and rolled back.
    pub transactions: bool,
    /// Trigger-based change journaling is available.
    pub journaling: bool,
    /// Whole-database snapshots can be exported and imported.
    pub snapshots: bool,
}

/// A dialect adapter: database lifecycle, snapshots and transactions on top
/// of a [`Connection`].
pub trait Driver {
    fn kind(&self) -> DriverKind;

    fn capabilities(&self) -> Capabilities;

    /// The open connection, scoped to the current database.
    fn connection(&self) -> DriverResult<&dyn Connection>;

    /// Trigger/DDL dialect for the change journal, when journaling is
    /// supported.
    fn journal_dialect(&self) -> Option<&dyn JournalDialect> {
        None
    }

    /// Longest database name the engine accepts.
    fn max_database_name_length(&self) -> usize;

    /// File extension used for this driver's snapshot files.
    fn snapshot_extension(&self) -> &'static str;

    /// The database the connection currently points at.
    fn current_database(&self) -> Option<&str>;

    /// Like [`Driver::current_database`], but a missing selection is an error.
    fn selected_database(&self) -> DriverResult<&str> {
        self.current_database()
            .ok_or_else(|| DriverError::NoDatabaseSelected(self.host()))
    }

    /// Point the connection at an existing database.
    fn use_database(&mut self, name: &str) -> DriverResult<()>;

    fn list_databases(&self) -> DriverResult<Vec<String>>;

    fn database_exists(&self, name: &str) -> DriverResult<bool> {
        Ok(self.list_databases()?.iter().any(|db| db == name))
    }

    /// Create `name` empty (dropping any previous copy) and switch to it.
    fn create_database(&mut self, name: &str) -> DriverResult<()>;

    /// Drop `name`. A database that is already gone counts as dropped.
    fn drop_database(&mut self, name: &str) -> DriverResult<()>;

    /// Base tables of the current database.
    fn list_tables(&self) -> DriverResult<Vec<String>>;

    fn table_exists(&self, table: &str) -> DriverResult<bool> {
        Ok(self.list_tables()?.iter().any(|t| t == table))
    }

    /// Serialize the whole current database to `path`.
    fn export_snapshot(&mut self, path: &Path) -> DriverResult<()>;

    /// Replace the current database's content with the snapshot at `path`.
    fn import_snapshot(&mut self, path: &Path) -> DriverResult<()>;

    /// Run a pre-migration SQL import file against the current database.
    fn import_sql_file(&mut self, path: &Path) -> DriverResult<()>;

    fn begin_transaction(&self) -> DriverResult<()> {
        self.connection()?.direct_exec("BEGIN")
    }

    fn rollback_transaction(&self) -> DriverResult<()> {
        self.connection()?.direct_exec("ROLLBACK")
    }

    /// Host label used in resolved settings and process-local cache keys.
    fn host(&self) -> String {
        "localhost".to_string()
    }
}

/// Quote an identifier with backticks (understood by MySQL and SQLite).
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
