//! Row-level change journal.
//!
//! Every user table gets a shadow *journal table* and three `AFTER`
//! triggers. While a test runs, each INSERT/UPDATE/DELETE copies a row into
//! the journal table and names the table in the *change tracker*. After the
//! test, [`ChangeJournal::reverse`] walks each changed table's journal newest
//! first and applies the inverse operation, leaving the database as it was
//! when the test started.
//!
//! What the triggers record:
//!
//! | action | row copied          | undo                                       |
//! |--------|---------------------|--------------------------------------------|
//! | INSERT | `NEW`               | delete the row by key                      |
//! | UPDATE | `OLD` + `NEW` key   | delete the row by its new key, re-insert   |
//! | DELETE | `OLD`               | re-insert the stored row                   |
//!
//! The post-update key lives in the `___dbfixture_keyN___` columns, so an
//! UPDATE that changes the key itself is still found on undo.
//!
//! Undo needs a primary key (or a unique index) on every journaled table.
//! The SQL shapes differ per engine and come from a [`JournalDialect`].

pub mod ddl;
pub mod mysql;

use std::fmt;

use crate::db::{quote_identifier, Connection, Driver, DriverError, DriverKind, SqlValue};
use crate::reuse::{RecordError, ReuseRecord};

pub use ddl::{TransformError, TransformStep};

/// Prefix shared by every table the engine itself creates.
pub const INTERNAL_TABLE_PREFIX: &str = "___dbfixture_";
/// Set of tables with pending journaled changes.
pub const CHANGE_TRACKER_TABLE: &str = "___dbfixture_changes___";
/// Column of [`CHANGE_TRACKER_TABLE`] holding the table name.
pub const TRACKER_COLUMN: &str = "table_name";
/// Journal tables are named `{JOURNAL_TABLE_PREFIX}{table}`.
pub const JOURNAL_TABLE_PREFIX: &str = "___dbfixture_journal_";
/// Surrogate, auto-incrementing id of a journal row.
pub const ID_COLUMN: &str = "___dbfixture_id___";
/// `INSERT`/`UPDATE`/`DELETE` tag of a journal row.
pub const ACTION_COLUMN: &str = "___dbfixture_action___";
const TRIGGER_PREFIX: &str = "___dbfixture_trg_";
/// Longest table or trigger name MySQL accepts.
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Journal table name for `table`.
#[must_use]
pub fn journal_table_name(table: &str) -> String {
    bounded_identifier(format!("{JOURNAL_TABLE_PREFIX}{table}"))
}

/// Name of the trigger journaling `action` on `table`.
#[must_use]
pub fn trigger_name(table: &str, action: JournalAction) -> String {
    bounded_identifier(format!(
        "{TRIGGER_PREFIX}{table}_{}",
        action.as_str().to_ascii_lowercase()
    ))
}

/// Journal column holding the post-update value of the key column at
/// `position`.
#[must_use]
pub fn new_key_column(position: usize) -> String {
    format!("{INTERNAL_TABLE_PREFIX}key{position}___")
}

/// `name` itself when it fits [`MAX_IDENTIFIER_LENGTH`], otherwise its head
/// followed by a hash of the whole name.
fn bounded_identifier(name: String) -> String {
    if name.chars().count() <= MAX_IDENTIFIER_LENGTH {
        return name;
    }
    let digest = blake3::hash(name.as_bytes()).to_hex();
    let suffix = &digest.as_str()[..12];
    let head: String = name
        .chars()
        .take(MAX_IDENTIFIER_LENGTH - suffix.len() - 1)
        .collect();
    format!("{head}_{suffix}")
}

/// Whether `table` is one of the engine's own bookkeeping tables.
#[must_use]
pub fn is_internal_table(table: &str) -> bool {
    table.starts_with(INTERNAL_TABLE_PREFIX)
}

/// A journaled row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalAction {
    Insert,
    Update,
    Delete,
}

impl JournalAction {
    pub const ALL: [Self; 3] = [Self::Insert, Self::Update, Self::Delete];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// The trigger row alias whose values are journaled.
    #[must_use]
    pub fn recorded_row(self) -> &'static str {
        match self {
            Self::Insert => "NEW",
            Self::Update | Self::Delete => "OLD",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for JournalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a dialect needs to emit one journaling trigger.
#[derive(Debug, Clone, Copy)]
pub struct TriggerSpec<'a> {
    pub table: &'a str,
    pub journal_table: &'a str,
    pub tracker_table: &'a str,
    pub action: JournalAction,
    pub columns: &'a [String],
    /// Key columns of `table`; UPDATE triggers also record their new values.
    pub key: &'a [String],
}

impl TriggerSpec<'_> {
    #[must_use]
    pub fn trigger_name(&self) -> String {
        trigger_name(self.table, self.action)
    }

    /// Quoted journal columns this trigger writes, paired with the trigger
    /// expressions feeding them.
    #[must_use]
    pub fn recorded_values(&self) -> (Vec<String>, Vec<String>) {
        let alias = self.action.recorded_row();
        let mut columns = vec![quote_identifier(ACTION_COLUMN)];
        let mut values = vec![format!("'{}'", self.action.as_str())];
        for column in self.columns {
            columns.push(quote_identifier(column));
            values.push(format!("{alias}.{}", quote_identifier(column)));
        }
        if self.action == JournalAction::Update {
            for (position, column) in self.key.iter().enumerate() {
                columns.push(quote_identifier(&new_key_column(position)));
                values.push(format!("NEW.{}", quote_identifier(column)));
            }
        }
        (columns, values)
    }

    /// The table name as a single-quoted SQL string literal.
    #[must_use]
    pub fn table_literal(&self) -> String {
        format!("'{}'", self.table.replace('\'', "''"))
    }
}

/// Engine-specific SQL used by the change journal.
pub trait JournalDialect {
    /// Column names of `table`, in definition order.
    fn columns(&self, conn: &dyn Connection, table: &str) -> Result<Vec<String>, DriverError>;

    /// Primary-key columns of `table`, or the columns of its first unique
    /// index. `None` when the table has neither.
    fn unique_key(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<Vec<String>>, DriverError>;

    /// `CREATE TABLE` for the change tracker.
    fn tracker_table_ddl(&self, tracker_table: &str) -> String;

    /// `CREATE TABLE` for the journal table shadowing `table`, including
    /// one [`new_key_column`] per `key` column.
    fn journal_table_ddl(
        &self,
        conn: &dyn Connection,
        table: &str,
        journal_table: &str,
        key: &[String],
    ) -> Result<String, JournalError>;

    /// `CREATE TRIGGER` recording one action on `spec.table`.
    fn trigger_ddl(&self, spec: &TriggerSpec<'_>) -> String;

    /// Names of the triggers defined on `table`.
    fn triggers(&self, conn: &dyn Connection, table: &str) -> Result<Vec<String>, DriverError>;

    fn drop_trigger_sql(&self, trigger: &str) -> String {
        format!("DROP TRIGGER IF EXISTS {}", quote_identifier(trigger))
    }

    fn foreign_key_checks(&self, conn: &dyn Connection) -> Result<bool, DriverError>;

    fn set_foreign_key_checks(&self, conn: &dyn Connection, enabled: bool)
        -> Result<(), DriverError>;

    /// Statement emptying `table`.
    fn truncate_sql(&self, table: &str) -> String {
        format!("TRUNCATE TABLE {}", quote_identifier(table))
    }
}

/// Errors raised while setting up or reversing the journal.
#[derive(thiserror::Error, Debug)]
pub enum JournalError {
    /// The driver cannot journal changes.
    #[error("the {0} driver does not support change journaling")]
    Unsupported(DriverKind),

    /// Undo needs a primary key or unique index to address rows.
    #[error("table {table} has no primary key or unique index, so its journaled changes cannot be reversed")]
    NoPrimaryKey { table: String },

    /// Rewriting the table definition failed.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// A setup statement failed for a specific table.
    #[error("journal setup step '{step}' failed for table {table}: {source}")]
    Setup {
        table: String,
        step: &'static str,
        #[source]
        source: DriverError,
    },

    /// A journal row carried an action tag that is not INSERT/UPDATE/DELETE.
    #[error("journal for table {table} contains unknown action {value:?}")]
    UnknownAction { table: String, value: String },

    /// Undoing one journal row failed.
    #[error("could not reverse {action} on table {table}: {source}")]
    Undo {
        table: String,
        action: JournalAction,
        #[source]
        source: DriverError,
    },

    /// The row an UPDATE left behind is no longer under its recorded key.
    #[error("could not reverse {action} on table {table}: no row matches the recorded key")]
    RowMissing { table: String, action: JournalAction },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// What one [`ChangeJournal::reverse`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseSummary {
    /// Tables whose changes were reversed, in tracker order.
    pub tables: Vec<String>,
    /// Journal rows applied.
    pub rows: usize,
}

impl ReverseSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Trigger-based journal over one driver's current database.
pub struct ChangeJournal<'d> {
    driver: &'d dyn Driver,
    dialect: &'d dyn JournalDialect,
}

impl<'d> ChangeJournal<'d> {
    /// Attach to `driver`, which must support journaling.
    pub fn new(driver: &'d dyn Driver) -> Result<Self, JournalError> {
        if !driver.capabilities().journaling {
            return Err(JournalError::Unsupported(driver.kind()));
        }
        let dialect = driver
            .journal_dialect()
            .ok_or(JournalError::Unsupported(driver.kind()))?;
        Ok(Self { driver, dialect })
    }

    /// Create the tracker, journal tables and triggers.
    ///
    /// Tables whose journal table and triggers all exist are left alone, so
    /// calling this on a reused database is cheap. A journal left half
    /// created is dropped and built again. Returns the newly journaled
    /// tables.
    pub fn set_up(&self) -> Result<Vec<String>, JournalError> {
        let conn = self.driver.connection()?;
        let tables = self.driver.list_tables()?;

        if !tables.iter().any(|t| t == CHANGE_TRACKER_TABLE) {
            conn.direct_exec(&self.dialect.tracker_table_ddl(CHANGE_TRACKER_TABLE))
                .map_err(|source| JournalError::Setup {
                    table: CHANGE_TRACKER_TABLE.to_string(),
                    step: "create change tracker",
                    source,
                })?;
        }

        let mut added = Vec::new();
        for table in tables.iter().filter(|t| !is_internal_table(t)) {
            let journal = journal_table_name(table);
            if tables.contains(&journal) {
                if self.has_all_triggers(conn, table)? {
                    continue;
                }
                log::warn!("Journal for table {table} is incomplete; recreating it");
                self.drop_journal(conn, table, &journal)?;
            }
            self.journal_table(conn, table, &journal)?;
            added.push(table.clone());
        }

        log::info!(
            "Journaling {} new table(s) in {:?}",
            added.len(),
            self.driver.current_database()
        );
        Ok(added)
    }

    fn has_all_triggers(&self, conn: &dyn Connection, table: &str) -> Result<bool, JournalError> {
        let existing = self
            .dialect
            .triggers(conn, table)
            .map_err(|source| JournalError::Setup {
                table: table.to_string(),
                step: "read triggers",
                source,
            })?;
        Ok(JournalAction::ALL
            .iter()
            .all(|action| existing.contains(&trigger_name(table, *action))))
    }

    fn drop_journal(
        &self,
        conn: &dyn Connection,
        table: &str,
        journal: &str,
    ) -> Result<(), JournalError> {
        let mut statements: Vec<String> = JournalAction::ALL
            .iter()
            .map(|action| self.dialect.drop_trigger_sql(&trigger_name(table, *action)))
            .collect();
        statements.push(format!("DROP TABLE IF EXISTS {}", quote_identifier(journal)));
        for sql in statements {
            conn.direct_exec(&sql)
                .map_err(|source| JournalError::Setup {
                    table: table.to_string(),
                    step: "drop incomplete journal",
                    source,
                })?;
        }
        Ok(())
    }

    fn journal_table(
        &self,
        conn: &dyn Connection,
        table: &str,
        journal: &str,
    ) -> Result<(), JournalError> {
        let key = self
            .dialect
            .unique_key(conn, table)
            .map_err(|source| JournalError::Setup {
                table: table.to_string(),
                step: "read key",
                source,
            })?
            .unwrap_or_default();
        let ddl = self.dialect.journal_table_ddl(conn, table, journal, &key)?;
        conn.direct_exec(&ddl)
            .map_err(|source| JournalError::Setup {
                table: table.to_string(),
                step: "create journal table",
                source,
            })?;

        let columns = self
            .dialect
            .columns(conn, table)
            .map_err(|source| JournalError::Setup {
                table: table.to_string(),
                step: "read columns",
                source,
            })?;

        for action in JournalAction::ALL {
            let spec = TriggerSpec {
                table,
                journal_table: journal,
                tracker_table: CHANGE_TRACKER_TABLE,
                action,
                columns: &columns,
                key: &key,
            };
            conn.direct_exec(&self.dialect.trigger_ddl(&spec))
                .map_err(|source| JournalError::Setup {
                    table: table.to_string(),
                    step: "create trigger",
                    source,
                })?;
        }
        log::debug!("Journal table {journal} created for {table}");
        Ok(())
    }

    /// Mark the database dirty before the test body runs, so a crash
    /// mid-test is visible on the next inspection.
    pub fn record_start(&self) -> Result<(), JournalError> {
        ReuseRecord::set_journal_dirty(self.driver.connection()?, true)?;
        Ok(())
    }

    /// Undo every journaled change and mark the database clean again.
    pub fn reverse(&self) -> Result<ReverseSummary, JournalError> {
        let conn = self.driver.connection()?;
        let changed: Vec<String> = conn
            .select(
                &format!(
                    "SELECT {} FROM {}",
                    quote_identifier(TRACKER_COLUMN),
                    quote_identifier(CHANGE_TRACKER_TABLE)
                ),
                &[],
            )?
            .iter()
            .filter_map(|row| row.get(TRACKER_COLUMN).and_then(SqlValue::to_text))
            .collect();

        if changed.is_empty() {
            log::debug!("Journal: nothing to reverse");
            ReuseRecord::set_journal_dirty(conn, false)?;
            return Ok(ReverseSummary::default());
        }

        let fk_checks = self.dialect.foreign_key_checks(conn)?;
        if fk_checks {
            self.dialect.set_foreign_key_checks(conn, false)?;
        }
        let undone = self.undo_tables(conn, &changed);
        if fk_checks {
            self.dialect.set_foreign_key_checks(conn, true)?;
        }
        let rows = undone?;

        for table in &changed {
            conn.direct_exec(&self.dialect.truncate_sql(&journal_table_name(table)))?;
        }
        conn.direct_exec(&self.dialect.truncate_sql(CHANGE_TRACKER_TABLE))?;
        ReuseRecord::set_journal_dirty(conn, false)?;

        log::info!(
            "Journal: reversed {rows} change(s) across {} table(s)",
            changed.len()
        );
        Ok(ReverseSummary {
            tables: changed,
            rows,
        })
    }

    fn undo_tables(&self, conn: &dyn Connection, tables: &[String]) -> Result<usize, JournalError> {
        let mut rows = 0;
        for table in tables {
            rows += self.undo_table(conn, table)?;
        }
        Ok(rows)
    }

    fn undo_table(&self, conn: &dyn Connection, table: &str) -> Result<usize, JournalError> {
        let key = self
            .dialect
            .unique_key(conn, table)?
            .filter(|k| !k.is_empty())
            .ok_or_else(|| JournalError::NoPrimaryKey {
                table: table.to_string(),
            })?;
        let columns = self.dialect.columns(conn, table)?;

        let entries = conn.select(
            &format!(
                "SELECT * FROM {} ORDER BY {} DESC",
                quote_identifier(&journal_table_name(table)),
                quote_identifier(ID_COLUMN)
            ),
            &[],
        )?;

        for entry in &entries {
            let raw = entry
                .get(ACTION_COLUMN)
                .and_then(SqlValue::to_text)
                .unwrap_or_default();
            let action = JournalAction::parse(&raw).ok_or_else(|| JournalError::UnknownAction {
                table: table.to_string(),
                value: raw.clone(),
            })?;
            for undo in UndoStatement::build(action, table, &columns, &key, entry) {
                let affected = match undo.step {
                    UndoStep::Reinsert => conn.insert(&undo.sql, &undo.params),
                    UndoStep::Remove | UndoStep::RemoveExisting => {
                        conn.update(&undo.sql, &undo.params)
                    }
                }
                .map_err(|source| JournalError::Undo {
                    table: table.to_string(),
                    action,
                    source,
                })?;
                if affected == 0 {
                    match undo.step {
                        UndoStep::RemoveExisting => {
                            return Err(JournalError::RowMissing {
                                table: table.to_string(),
                                action,
                            });
                        }
                        UndoStep::Remove => {
                            log::debug!("Journal: row inserted into {table} is already gone");
                        }
                        UndoStep::Reinsert => {}
                    }
                }
            }
        }

        log::debug!("Journal: reversed {} row(s) of {table}", entries.len());
        Ok(entries.len())
    }
}

/// How an undo statement is run and what an empty result means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UndoStep {
    /// Delete by key; a row that is already gone is the state being restored.
    Remove,
    /// Delete by key; the row must be there.
    RemoveExisting,
    /// Insert the stored row.
    Reinsert,
}

/// One statement of the inverse of a journal row.
#[derive(Debug, Clone, PartialEq)]
struct UndoStatement {
    sql: String,
    params: Vec<SqlValue>,
    step: UndoStep,
}

impl UndoStatement {
    /// Statements reversing `entry`, in execution order.
    fn build(
        action: JournalAction,
        table: &str,
        columns: &[String],
        key: &[String],
        entry: &crate::db::Row,
    ) -> Vec<Self> {
        let value = |column: &str| entry.get(column).cloned().unwrap_or(SqlValue::Null);
        let quoted_table = quote_identifier(table);

        let remove = |predicate: String, params: Vec<SqlValue>, step: UndoStep| Self {
            sql: format!("DELETE FROM {quoted_table} WHERE {predicate}"),
            params,
            step,
        };
        let reinsert = || {
            let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            Self {
                sql: format!(
                    "INSERT INTO {quoted_table} ({}) VALUES ({placeholders})",
                    names.join(", ")
                ),
                params: columns.iter().map(|c| value(c.as_str())).collect(),
                step: UndoStep::Reinsert,
            }
        };

        match action {
            JournalAction::Insert => {
                let (predicate, params) = key_predicate(key, &value);
                vec![remove(predicate, params, UndoStep::Remove)]
            }
            JournalAction::Update => {
                let new_key = |column: &str| {
                    key.iter()
                        .position(|k| k == column)
                        .map_or(SqlValue::Null, |position| value(&new_key_column(position)))
                };
                let (predicate, params) = key_predicate(key, &new_key);
                vec![
                    remove(predicate, params, UndoStep::RemoveExisting),
                    reinsert(),
                ]
            }
            JournalAction::Delete => vec![reinsert()],
        }
    }
}

/// `a = ? AND b IS NULL ...` for the key columns of one journal row.
fn key_predicate(
    key: &[String],
    value: &dyn Fn(&str) -> SqlValue,
) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::with_capacity(key.len());
    let mut params = Vec::new();
    for column in key {
        let v = value(column);
        if v.is_null() {
            clauses.push(format!("{} IS NULL", quote_identifier(column)));
        } else {
            clauses.push(format!("{} = ?", quote_identifier(column)));
            params.push(v);
        }
    }
    (clauses.join(" AND "), params)
}
