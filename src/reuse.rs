//! The reuse metadata record stored inside every managed database.
//!
//! A single-row table, [`REUSE_TABLE`], records who built the database,
//! from which fingerprints, and whether it is currently clean. It is
//! written the moment a database is created, before any migration runs, so
//! a half-built database is still recognisable as ours.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{quote_identifier, Connection, Driver, DriverError, SqlValue};

/// Name of the metadata table.
pub const REUSE_TABLE: &str = "___dbfixture_reuse___";
/// Format version of [`REUSE_TABLE`]. Records with another version are not
/// usable.
pub const REUSE_TABLE_VERSION: &str = "1";

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("could not access the reuse record: {0}")]
    Driver(#[from] DriverError),

    /// The record table exists but has no row.
    #[error("database {database} has a reuse table without a record")]
    Empty { database: String },
}

/// Provenance and cleanliness of one managed database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReuseRecord {
    pub project_name: String,
    pub reuse_table_version: String,
    pub orig_db_name: String,
    pub build_checksum: String,
    pub scenario_checksum: String,
    pub snapshot_checksum: Option<String>,
    pub transaction_reusable: bool,
    pub journal_reusable: bool,
    /// 1 while the wrapping transaction is open; still 1 afterwards means
    /// the transaction was committed.
    pub inside_transaction: bool,
    /// Set before a journaled test runs, cleared once it is reversed.
    pub journal_dirty: bool,
    pub last_used: DateTime<Utc>,
}

impl ReuseRecord {
    /// A record for a database that is being built and is not reusable yet.
    #[must_use]
    pub fn provisional(
        project_name: &str,
        orig_db_name: &str,
        build_checksum: &str,
        scenario_checksum: &str,
    ) -> Self {
        Self {
            project_name: project_name.to_string(),
            reuse_table_version: REUSE_TABLE_VERSION.to_string(),
            orig_db_name: orig_db_name.to_string(),
            build_checksum: build_checksum.to_string(),
            scenario_checksum: scenario_checksum.to_string(),
            snapshot_checksum: None,
            transaction_reusable: false,
            journal_reusable: false,
            inside_transaction: false,
            journal_dirty: false,
            last_used: Utc::now(),
        }
    }

    /// Whether this record was written by a compatible version.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        self.reuse_table_version == REUSE_TABLE_VERSION
    }

    /// Whether the previous run left the database in an unknown state.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inside_transaction || self.journal_dirty
    }

    /// Read the record of the driver's current database.
    ///
    /// Returns `Ok(None)` when the database has no reuse table.
    pub fn load(driver: &dyn Driver) -> Result<Option<Self>, RecordError> {
        if !driver.table_exists(REUSE_TABLE)? {
            return Ok(None);
        }
        let rows = driver
            .connection()?
            .select(&format!("SELECT * FROM {}", quote_identifier(REUSE_TABLE)), &[])?;
        let database = driver.selected_database()?;
        if rows.len() > 1 {
            log::warn!(
                "Reuse table in {database} holds {} rows; using the first",
                rows.len()
            );
        }
        let row = rows.first().ok_or_else(|| RecordError::Empty {
            database: database.to_string(),
        })?;

        let text = |column: &str| row.get(column).and_then(SqlValue::to_text);
        let flag = |column: &str| {
            row.get(column)
                .and_then(SqlValue::as_bool)
                .unwrap_or(false)
        };

        Ok(Some(Self {
            project_name: text("project_name").unwrap_or_default(),
            // Older layouts without a version column are never compatible.
            reuse_table_version: text("reuse_table_version").unwrap_or_default(),
            orig_db_name: text("orig_db_name").unwrap_or_default(),
            build_checksum: text("build_checksum").unwrap_or_default(),
            scenario_checksum: text("scenario_checksum").unwrap_or_default(),
            snapshot_checksum: text("snapshot_checksum"),
            transaction_reusable: flag("transaction_reusable"),
            journal_reusable: flag("journal_reusable"),
            inside_transaction: flag("inside_transaction"),
            journal_dirty: flag("journal_dirty"),
            last_used: text("last_used")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map_or(DateTime::<Utc>::UNIX_EPOCH, |d| d.with_timezone(&Utc)),
        }))
    }

    /// Write this record as the database's only row, creating the table
    /// when needed.
    ///
    /// The old row is replaced inside one transaction, so the table is
    /// never left empty.
    pub fn save(&self, conn: &dyn Connection) -> Result<(), RecordError> {
        conn.direct_exec(&create_table_sql())?;
        conn.direct_exec("BEGIN")?;
        if let Err(err) = self.replace_row(conn) {
            if let Err(rollback) = conn.direct_exec("ROLLBACK") {
                log::warn!("Could not roll back the reuse record write: {rollback}");
            }
            return Err(err);
        }
        conn.direct_exec("COMMIT")?;
        Ok(())
    }

    fn replace_row(&self, conn: &dyn Connection) -> Result<(), RecordError> {
        conn.update(&format!("DELETE FROM {}", quote_identifier(REUSE_TABLE)), &[])?;
        conn.insert(
            &format!(
                "INSERT INTO {} (project_name, reuse_table_version, orig_db_name, \
                 build_checksum, scenario_checksum, snapshot_checksum, transaction_reusable, \
                 journal_reusable, inside_transaction, journal_dirty, last_used) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                quote_identifier(REUSE_TABLE)
            ),
            &[
                SqlValue::from(self.project_name.as_str()),
                SqlValue::from(self.reuse_table_version.as_str()),
                SqlValue::from(self.orig_db_name.as_str()),
                SqlValue::from(self.build_checksum.as_str()),
                SqlValue::from(self.scenario_checksum.as_str()),
                SqlValue::from(self.snapshot_checksum.clone()),
                SqlValue::from(self.transaction_reusable),
                SqlValue::from(self.journal_reusable),
                SqlValue::from(self.inside_transaction),
                SqlValue::from(self.journal_dirty),
                SqlValue::from(self.last_used.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Drop the record table.
    pub fn remove(conn: &dyn Connection) -> Result<(), RecordError> {
        conn.direct_exec(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_identifier(REUSE_TABLE)
        ))?;
        Ok(())
    }

    pub fn set_inside_transaction(conn: &dyn Connection, inside: bool) -> Result<(), RecordError> {
        set_column(conn, "inside_transaction", SqlValue::from(inside))
    }

    /// Read `inside_transaction` straight from the table.
    pub fn read_inside_transaction(conn: &dyn Connection) -> Result<bool, RecordError> {
        let rows = conn.select(
            &format!(
                "SELECT inside_transaction FROM {}",
                quote_identifier(REUSE_TABLE)
            ),
            &[],
        )?;
        Ok(rows
            .first()
            .and_then(|row| row.get("inside_transaction"))
            .and_then(SqlValue::as_bool)
            .unwrap_or(false))
    }

    pub fn set_journal_dirty(conn: &dyn Connection, dirty: bool) -> Result<(), RecordError> {
        set_column(conn, "journal_dirty", SqlValue::from(dirty))
    }

    /// Refresh `last_used`.
    pub fn touch(conn: &dyn Connection) -> Result<(), RecordError> {
        set_column(conn, "last_used", SqlValue::from(Utc::now().to_rfc3339()))
    }
}

fn set_column(conn: &dyn Connection, column: &str, value: SqlValue) -> Result<(), RecordError> {
    conn.update(
        &format!(
            "UPDATE {} SET {} = ?",
            quote_identifier(REUSE_TABLE),
            quote_identifier(column)
        ),
        &[value],
    )?;
    Ok(())
}

fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         project_name VARCHAR(255) NOT NULL, \
         reuse_table_version VARCHAR(16) NOT NULL, \
         orig_db_name VARCHAR(255) NOT NULL, \
         build_checksum VARCHAR(64) NOT NULL, \
         scenario_checksum VARCHAR(64) NOT NULL, \
         snapshot_checksum VARCHAR(64) NULL, \
         transaction_reusable TINYINT NOT NULL DEFAULT 0, \
         journal_reusable TINYINT NOT NULL DEFAULT 0, \
         inside_transaction TINYINT NOT NULL DEFAULT 0, \
         journal_dirty TINYINT NOT NULL DEFAULT 0, \
         last_used VARCHAR(40) NOT NULL)",
        quote_identifier(REUSE_TABLE)
    )
}
