//! MySQL statements for the change journal.

use super::ddl::journal_table_definition;
use super::{JournalDialect, JournalError, TriggerSpec, TRACKER_COLUMN};
use crate::db::{quote_identifier, Connection, DriverError, SqlValue};

/// Journal dialect for MySQL-compatible servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlJournalDialect;

impl JournalDialect for MysqlJournalDialect {
    fn columns(&self, conn: &dyn Connection, table: &str) -> Result<Vec<String>, DriverError> {
        Ok(conn
            .select(&format!("SHOW COLUMNS FROM {}", quote_identifier(table)), &[])?
            .iter()
            .filter_map(|row| row.get("Field").and_then(SqlValue::to_text))
            .collect())
    }

    fn unique_key(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<Vec<String>>, DriverError> {
        let rows = conn.select(&format!("SHOW KEYS FROM {}", quote_identifier(table)), &[])?;

        // (key name, seq, column) for unique keys, in server order.
        let mut keys: Vec<(String, i64, String)> = rows
            .iter()
            .filter(|row| row.get("Non_unique").and_then(SqlValue::as_i64) == Some(0))
            .filter_map(|row| {
                Some((
                    row.get("Key_name")?.to_text()?,
                    row.get("Seq_in_index")?.as_i64()?,
                    row.get("Column_name")?.to_text()?,
                ))
            })
            .collect();

        let chosen = if keys.iter().any(|(name, _, _)| name == "PRIMARY") {
            "PRIMARY".to_string()
        } else {
            match keys.first() {
                Some((name, _, _)) => name.clone(),
                None => return Ok(None),
            }
        };
        keys.retain(|(name, _, _)| *name == chosen);
        keys.sort_by_key(|(_, seq, _)| *seq);
        Ok(Some(keys.into_iter().map(|(_, _, column)| column).collect()))
    }

    fn tracker_table_ddl(&self, tracker_table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(64) NOT NULL, PRIMARY KEY ({})) ENGINE=InnoDB",
            quote_identifier(tracker_table),
            quote_identifier(TRACKER_COLUMN),
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
        let rows = conn
            .select(&format!("SHOW CREATE TABLE {}", quote_identifier(table)), &[])
            .map_err(|source| JournalError::Setup {
                table: table.to_string(),
                step: "read table definition",
                source,
            })?;
        let create = rows
            .first()
            .and_then(|row| row.get("Create Table").or_else(|| row.get_index(1)))
            .and_then(SqlValue::to_text)
            .ok_or_else(|| JournalError::Setup {
                table: table.to_string(),
                step: "read table definition",
                source: DriverError::query("SHOW CREATE TABLE", "no definition returned"),
            })?;
        Ok(journal_table_definition(&create, journal_table, key)?)
    }

    fn trigger_ddl(&self, spec: &TriggerSpec<'_>) -> String {
        let (columns, values) = spec.recorded_values();
        format!(
            "CREATE TRIGGER {name} AFTER {action} ON {table} FOR EACH ROW BEGIN\n  \
             INSERT INTO {journal} ({columns}) VALUES ({values});\n  \
             INSERT IGNORE INTO {tracker} ({tracker_column}) VALUES ({literal});\n\
             END",
            name = quote_identifier(&spec.trigger_name()),
            action = spec.action.as_str(),
            table = quote_identifier(spec.table),
            journal = quote_identifier(spec.journal_table),
            columns = columns.join(", "),
            values = values.join(", "),
            tracker = quote_identifier(spec.tracker_table),
            tracker_column = quote_identifier(TRACKER_COLUMN),
            literal = spec.table_literal(),
        )
    }

    fn triggers(&self, conn: &dyn Connection, table: &str) -> Result<Vec<String>, DriverError> {
        Ok(conn
            .select(
                "SELECT TRIGGER_NAME FROM INFORMATION_SCHEMA.TRIGGERS \
                 WHERE TRIGGER_SCHEMA = DATABASE() AND EVENT_OBJECT_TABLE = ?",
                &[SqlValue::from(table)],
            )?
            .iter()
            .filter_map(|row| row.get("TRIGGER_NAME").and_then(SqlValue::to_text))
            .collect())
    }

    fn foreign_key_checks(&self, conn: &dyn Connection) -> Result<bool, DriverError> {
        let rows = conn.select("SELECT @@FOREIGN_KEY_CHECKS AS fk_checks", &[])?;
        Ok(rows
            .first()
            .and_then(|row| row.get("fk_checks"))
            .and_then(SqlValue::as_bool)
            .unwrap_or(true))
    }

    fn set_foreign_key_checks(
        &self,
        conn: &dyn Connection,
        enabled: bool,
    ) -> Result<(), DriverError> {
        conn.direct_exec(&format!("SET FOREIGN_KEY_CHECKS = {}", u8::from(enabled)))
    }
}
