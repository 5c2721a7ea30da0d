//! SQLite driver: one file per database.
//!
//! Databases live as `{directory}/{name}.sqlite`. Snapshots are plain file
//! copies; the connection is closed for the duration of every copy so the
//! file is never read while SQLite still holds cached pages or schema for
//! it. Journaling is not offered by this driver.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;

use super::{
    Capabilities, Connection, Driver, DriverError, DriverKind, DriverResult, Row, SqlValue,
};

const DATABASE_EXTENSION: &str = "sqlite";
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Self::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

/// A [`Connection`] backed by a rusqlite handle.
#[derive(Debug)]
pub struct SqliteConnection {
    path: PathBuf,
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> DriverResult<Self> {
        let conn = rusqlite::Connection::open(path).map_err(|source| DriverError::Sqlite {
            path: path.to_path_buf(),
            source,
        })?;
        let this = Self {
            path: path.to_path_buf(),
            conn,
        };
        this.configure()?;
        Ok(this)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> DriverResult<Self> {
        let path = PathBuf::from(":memory:");
        let conn = rusqlite::Connection::open_in_memory().map_err(|source| {
            DriverError::Sqlite {
                path: path.clone(),
                source,
            }
        })?;
        let this = Self { path, conn };
        this.configure()?;
        Ok(this)
    }

    fn configure(&self) -> DriverResult<()> {
        // Parallel test workers may open sibling files in the same directory.
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .map_err(|source| self.sqlite_error(source))?;
        self.direct_exec("PRAGMA foreign_keys = ON")
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the handle, surfacing any error SQLite reports on close.
    pub fn close(self) -> DriverResult<()> {
        let path = self.path;
        self.conn
            .close()
            .map_err(|(_, source)| DriverError::Sqlite { path, source })
    }

    fn sqlite_error(&self, source: rusqlite::Error) -> DriverError {
        DriverError::Sqlite {
            path: self.path.clone(),
            source,
        }
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> DriverResult<u64> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| DriverError::query(sql, e))?;
        let affected = stmt
            .execute(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| DriverError::query(sql, e))?;
        Ok(affected as u64)
    }
}

impl Connection for SqliteConnection {
    fn select(&self, sql: &str, params: &[SqlValue]) -> DriverResult<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| DriverError::query(sql, e))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| DriverError::query(sql, e))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| DriverError::query(sql, e))? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let value = row.get_ref(i).map_err(|e| DriverError::query(sql, e))?;
                values.push(value_from_ref(value));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn insert(&self, sql: &str, params: &[SqlValue]) -> DriverResult<u64> {
        self.execute(sql, params)
    }

    fn update(&self, sql: &str, params: &[SqlValue]) -> DriverResult<u64> {
        self.execute(sql, params)
    }

    fn statement(&self, sql: &str, params: &[SqlValue]) -> DriverResult<()> {
        self.execute(sql, params).map(|_| ())
    }

    fn direct_exec(&self, sql: &str) -> DriverResult<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| DriverError::query(sql, e))
    }
}

/// File-based driver: each database is a `.sqlite` file in one directory.
#[derive(Debug)]
pub struct SqliteDriver {
    directory: PathBuf,
    current: Option<String>,
    conn: Option<SqliteConnection>,
}

impl SqliteDriver {
    /// Create a driver storing its database files in `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            current: None,
            conn: None,
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the file holding database `name`.
    #[must_use]
    pub fn database_path(&self, name: &str) -> PathBuf {
        self.directory
            .join(format!("{name}.{DATABASE_EXTENSION}"))
    }

    fn current_path(&self) -> DriverResult<PathBuf> {
        self.current
            .as_deref()
            .map(|name| self.database_path(name))
            .ok_or_else(|| DriverError::NoDatabaseSelected(self.directory.display().to_string()))
    }

    fn disconnect(&mut self) -> DriverResult<()> {
        match self.conn.take() {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }

    fn reconnect(&mut self) -> DriverResult<()> {
        let path = self.current_path()?;
        self.conn = Some(SqliteConnection::open(&path)?);
        Ok(())
    }

    /// Close the connection, run `op` on the current database file, reopen.
    fn while_disconnected<F>(&mut self, op: F) -> DriverResult<()>
    where
        F: FnOnce(&Path) -> DriverResult<()>,
    {
        let path = self.current_path()?;
        self.disconnect()?;
        let result = op(&path);
        self.reconnect()?;
        result
    }

    fn ensure_directory(&self) -> DriverResult<()> {
        fs::create_dir_all(&self.directory).map_err(|source| DriverError::Io {
            path: self.directory.clone(),
            source,
        })
    }
}

fn remove_if_exists(path: &Path) -> DriverResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DriverError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_database_files(path: &Path) -> DriverResult<()> {
    remove_if_exists(path)?;
    for suffix in SIDE_FILE_SUFFIXES {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        remove_if_exists(Path::new(&side))?;
    }
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> DriverResult<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|source| DriverError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::copy(from, to).map_err(|source| DriverError::Io {
        path: from.to_path_buf(),
        source,
    })?;
    Ok(())
}

impl Driver for SqliteDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            reuse: true,
            transactions: true,
            journaling: false,
            snapshots: true,
        }
    }

    fn connection(&self) -> DriverResult<&dyn Connection> {
        self.conn
            .as_ref()
            .map(|c| c as &dyn Connection)
            .ok_or_else(|| DriverError::NoDatabaseSelected(self.directory.display().to_string()))
    }

    fn max_database_name_length(&self) -> usize {
        // Common filesystem limit of 255 bytes, minus the extension.
        255 - DATABASE_EXTENSION.len() - 1
    }

    fn snapshot_extension(&self) -> &'static str {
        DATABASE_EXTENSION
    }

    fn current_database(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn use_database(&mut self, name: &str) -> DriverResult<()> {
        let path = self.database_path(name);
        if !path.is_file() {
            return Err(DriverError::DatabaseNotFound(path.display().to_string()));
        }
        if self.current.as_deref() == Some(name) && self.conn.is_some() {
            return Ok(());
        }
        self.disconnect()?;
        self.conn = Some(SqliteConnection::open(&path)?);
        self.current = Some(name.to_string());
        Ok(())
    }

    fn list_databases(&self) -> DriverResult<Vec<String>> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DriverError::Io {
                    path: self.directory.clone(),
                    source,
                })
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(DATABASE_EXTENSION)
            })
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(ToString::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn database_exists(&self, name: &str) -> DriverResult<bool> {
        Ok(self.database_path(name).is_file())
    }

    fn create_database(&mut self, name: &str) -> DriverResult<()> {
        self.ensure_directory()?;
        if self.current.as_deref() == Some(name) {
            self.disconnect()?;
        }
        let path = self.database_path(name);
        remove_database_files(&path)?;
        self.disconnect()?;
        self.conn = Some(SqliteConnection::open(&path)?);
        self.current = Some(name.to_string());
        log::debug!("Created sqlite database {}", path.display());
        Ok(())
    }

    fn drop_database(&mut self, name: &str) -> DriverResult<()> {
        if self.current.as_deref() == Some(name) {
            self.disconnect()?;
            self.current = None;
        }
        remove_database_files(&self.database_path(name))
    }

    fn list_tables(&self) -> DriverResult<Vec<String>> {
        let sql = "SELECT name FROM sqlite_master \
                   WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
        Ok(self
            .connection()?
            .select(sql, &[])?
            .iter()
            .filter_map(|row| row.get("name").and_then(SqlValue::to_text))
            .collect())
    }

    fn export_snapshot(&mut self, path: &Path) -> DriverResult<()> {
        let target = path.to_path_buf();
        self.while_disconnected(|db_path| copy_file(db_path, &target))
    }

    fn import_snapshot(&mut self, path: &Path) -> DriverResult<()> {
        if !path.is_file() {
            return Err(DriverError::DatabaseNotFound(path.display().to_string()));
        }
        let source = path.to_path_buf();
        self.while_disconnected(|db_path| {
            remove_database_files(db_path)?;
            copy_file(&source, db_path)
        })
    }

    fn import_sql_file(&mut self, path: &Path) -> DriverResult<()> {
        let sql = fs::read_to_string(path).map_err(|source| DriverError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.connection()?.direct_exec(&sql)
    }

    fn host(&self) -> String {
        self.directory.display().to_string()
    }
}
