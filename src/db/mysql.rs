//! MySQL driver: schema-per-database on a server connection.
//!
//! The driver does not bundle a wire client. Callers hand it any
//! [`Connection`] talking to the server; snapshots and pre-migration imports
//! go through the `mysqldump` and `mysql` command-line clients.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use super::{
    quote_identifier, Capabilities, Connection, Driver, DriverError, DriverKind, DriverResult,
    SqlValue,
};
use crate::journal::mysql::MysqlJournalDialect;
use crate::journal::JournalDialect;

/// Longest schema name MySQL accepts.
pub const MAX_DATABASE_NAME_LENGTH: usize = 64;

/// Server coordinates handed to the command-line clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Directory holding `mysql`/`mysqldump`; `None` searches `PATH`.
    pub bin_dir: Option<PathBuf>,
    pub charset: String,
    pub collation: String,
}

impl Default for MysqlSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            bin_dir: None,
            charset: "utf8mb4".to_string(),
            collation: "utf8mb4_unicode_ci".to_string(),
        }
    }
}

impl MysqlSettings {
    fn executable(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// A `mysql`/`mysqldump` invocation carrying the connection options.
    ///
    /// The password goes through `MYSQL_PWD` so it never shows up in the
    /// process list.
    fn client_command(&self, name: &str) -> Command {
        let mut command = Command::new(self.executable(name));
        command.args([
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            format!("--user={}", self.username),
        ]);
        if !self.password.is_empty() {
            command.env("MYSQL_PWD", &self.password);
        }
        command
    }
}

/// Driver for MySQL-compatible servers.
pub struct MysqlDriver {
    conn: Box<dyn Connection>,
    settings: MysqlSettings,
    current: Option<String>,
    dialect: MysqlJournalDialect,
}

impl std::fmt::Debug for MysqlDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlDriver")
            .field("conn", &"<connection>")
            .field("host", &self.settings.host)
            .field("port", &self.settings.port)
            .field("current", &self.current)
            .finish()
    }
}

impl MysqlDriver {
    #[must_use]
    pub fn new(conn: Box<dyn Connection>, settings: MysqlSettings) -> Self {
        Self {
            conn,
            settings,
            current: None,
            dialect: MysqlJournalDialect,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &MysqlSettings {
        &self.settings
    }

    fn current_name(&self) -> DriverResult<&str> {
        self.current
            .as_deref()
            .ok_or_else(|| DriverError::NoDatabaseSelected(self.settings.host.clone()))
    }

    /// Run a client command, optionally feeding `stdin_from` to it.
    fn run_tool(
        &self,
        mut command: Command,
        file: &Path,
        stdin_from: Option<File>,
    ) -> DriverResult<()> {
        let program = PathBuf::from(command.get_program());
        command.stdout(Stdio::null()).stderr(Stdio::piped());
        if let Some(input) = stdin_from {
            command.stdin(Stdio::from(input));
        }

        log::debug!("Running {} for {}", program.display(), file.display());
        let output = command.output().map_err(|source| DriverError::ToolUnavailable {
            program: program.to_path_buf(),
            source,
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::ToolFailed {
                program: program.to_path_buf(),
                path: file.to_path_buf(),
                status: output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn import_with_client(&self, path: &Path) -> DriverResult<()> {
        let database = self.current_name()?.to_string();
        let input = File::open(path).map_err(|source| DriverError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut command = self.settings.client_command("mysql");
        command.arg(database);
        self.run_tool(command, path, Some(input))
    }
}

impl Driver for MysqlDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Mysql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            reuse: true,
            transactions: true,
            journaling: true,
            snapshots: true,
        }
    }

    fn connection(&self) -> DriverResult<&dyn Connection> {
        Ok(self.conn.as_ref())
    }

    fn journal_dialect(&self) -> Option<&dyn JournalDialect> {
        Some(&self.dialect)
    }

    fn max_database_name_length(&self) -> usize {
        MAX_DATABASE_NAME_LENGTH
    }

    fn snapshot_extension(&self) -> &'static str {
        "sql"
    }

    fn current_database(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn use_database(&mut self, name: &str) -> DriverResult<()> {
        self.conn
            .direct_exec(&format!("USE {}", quote_identifier(name)))?;
        self.current = Some(name.to_string());
        Ok(())
    }

    fn list_databases(&self) -> DriverResult<Vec<String>> {
        Ok(self
            .conn
            .select("SHOW DATABASES", &[])?
            .iter()
            .filter_map(|row| row.get_index(0).and_then(SqlValue::to_text))
            .collect())
    }

    fn database_exists(&self, name: &str) -> DriverResult<bool> {
        let rows = self.conn.select(
            "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?",
            &[SqlValue::from(name)],
        )?;
        Ok(!rows.is_empty())
    }

    fn create_database(&mut self, name: &str) -> DriverResult<()> {
        let quoted = quote_identifier(name);
        self.conn
            .direct_exec(&format!("DROP DATABASE IF EXISTS {quoted}"))?;
        self.conn.direct_exec(&format!(
            "CREATE DATABASE {quoted} CHARACTER SET {} COLLATE {}",
            self.settings.charset, self.settings.collation
        ))?;
        self.use_database(name)
    }

    fn drop_database(&mut self, name: &str) -> DriverResult<()> {
        self.conn
            .direct_exec(&format!("DROP DATABASE IF EXISTS {}", quote_identifier(name)))?;
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        Ok(())
    }

    fn list_tables(&self) -> DriverResult<Vec<String>> {
        Ok(self
            .conn
            .select("SHOW FULL TABLES WHERE Table_type = 'BASE TABLE'", &[])?
            .iter()
            .filter_map(|row| row.get_index(0).and_then(SqlValue::to_text))
            .collect())
    }

    fn export_snapshot(&mut self, path: &Path) -> DriverResult<()> {
        let database = self.current_name()?.to_string();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DriverError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut command = self.settings.client_command("mysqldump");
        command.args([
            "--add-drop-table".to_string(),
            "--skip-lock-tables".to_string(),
            "--single-transaction".to_string(),
            "--skip-triggers".to_string(),
            format!("--result-file={}", path.display()),
            database,
        ]);
        self.run_tool(command, path, None)
    }

    fn import_snapshot(&mut self, path: &Path) -> DriverResult<()> {
        self.import_with_client(path)
    }

    fn import_sql_file(&mut self, path: &Path) -> DriverResult<()> {
        self.import_with_client(path)
    }

    fn begin_transaction(&self) -> DriverResult<()> {
        self.conn.direct_exec("START TRANSACTION")
    }

    fn host(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }
}
