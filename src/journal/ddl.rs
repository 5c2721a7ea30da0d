//! Table-definition rewriting for journal tables.
//!
//! A `SHOW CREATE TABLE` statement is parsed into a small
//! [`TableDefinition`] (name, column list, key clauses, table options) and
//! then passed through independent transforms:
//!
//! 1. [`strip_auto_increment`]: drop `AUTO_INCREMENT` from columns/options
//! 2. [`strip_zero_dates`]: drop `DEFAULT '0000-00-00 ...'`
//! 3. [`relax_not_null`]: every column becomes `NULL DEFAULT NULL`
//! 4. [`replace_keys`]: all key/constraint clauses become one surrogate
//!    primary key
//! 5. [`rename`]: the journal table's name
//! 6. [`prepend_journal_columns`]: surrogate id and action columns
//! 7. [`append_key_columns`]: copies of the key columns holding the
//!    post-update key of UPDATE rows
//!
//! Journal rows are copied verbatim from the source table, so original
//! constraints and defaults only get in the way of a valid undo.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use super::{new_key_column, ACTION_COLUMN, ID_COLUMN};
use crate::db::quote_identifier;

static CREATE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?`((?:[^`]|``)+)`\s*\(")
        .expect("valid header regex")
});
static AUTO_INCREMENT_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+AUTO_INCREMENT\b").expect("valid regex"));
static AUTO_INCREMENT_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\bAUTO_INCREMENT\s*=\s*\d+").expect("valid regex"));
static ZERO_DATE_DEFAULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+DEFAULT\s+'0000-00-00(?: 00:00:00(?:\.0+)?)?'").expect("valid regex")
});
static DEFAULT_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\s+DEFAULT\s+(?:",
        r"'(?:[^'\\]|\\.|'')*'",
        r"|b'[01]*'",
        r"|-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?",
        r"|\((?:[^()]|\([^()]*\))*\)",
        r"|[A-Za-z_][A-Za-z0-9_]*(?:\(\d*\))?",
        r")"
    ))
    .expect("valid regex")
});
static ON_UPDATE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+ON\s+UPDATE\s+[A-Za-z_]+(?:\(\d*\))?").expect("valid regex")
});
static NOT_NULL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+NOT\s+NULL\b").expect("valid regex"));
static NULLABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+NULL\b").expect("valid regex"));

/// The individual rewriting steps, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStep {
    Parse,
    StripAutoIncrement,
    StripZeroDates,
    RelaxNotNull,
    ReplaceKeys,
    Rename,
    PrependJournalColumns,
    AppendKeyColumns,
}

impl fmt::Display for TransformStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "parse table definition",
            Self::StripAutoIncrement => "strip AUTO_INCREMENT",
            Self::StripZeroDates => "strip zero-date defaults",
            Self::RelaxNotNull => "relax NOT NULL",
            Self::ReplaceKeys => "replace key clauses",
            Self::Rename => "rename table",
            Self::PrependJournalColumns => "prepend journal columns",
            Self::AppendKeyColumns => "append key columns",
        };
        f.write_str(name)
    }
}

/// A rewriting step could not be applied to a table definition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("journal table rewrite '{step}' failed for table {table}: {reason}")]
pub struct TransformError {
    pub step: TransformStep,
    pub table: String,
    pub reason: String,
}

impl TransformError {
    fn new(step: TransformStep, table: &str, reason: impl Into<String>) -> Self {
        Self {
            step,
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}

/// One column: its bare name and the rest of its definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub definition: String,
}

/// Minimal structure of a `CREATE TABLE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    /// Key, index and constraint clauses, verbatim.
    pub keys: Vec<String>,
    /// Everything after the closing parenthesis (`ENGINE=...`).
    pub options: String,
}

impl TableDefinition {
    /// Parse `SHOW CREATE TABLE` output.
    pub fn parse(sql: &str) -> Result<Self, TransformError> {
        let header = CREATE_HEADER.captures(sql).ok_or_else(|| {
            TransformError::new(
                TransformStep::Parse,
                "<unknown>",
                "statement does not start with CREATE TABLE `name` (",
            )
        })?;
        let name = header[1].replace("``", "`");
        let body_start = header.get(0).map_or(0, |m| m.end());
        let body_end = find_closing_paren(sql, body_start).ok_or_else(|| {
            TransformError::new(TransformStep::Parse, &name, "unbalanced parentheses")
        })?;

        let mut columns = Vec::new();
        let mut keys = Vec::new();
        for item in split_top_level(&sql[body_start..body_end]) {
            if let Some(rest) = item.strip_prefix('`') {
                let (column, definition) = split_column(rest).ok_or_else(|| {
                    TransformError::new(
                        TransformStep::Parse,
                        &name,
                        format!("unterminated column name in `{item}`"),
                    )
                })?;
                columns.push(ColumnDefinition {
                    name: column,
                    definition,
                });
            } else {
                keys.push(item);
            }
        }

        if columns.is_empty() {
            return Err(TransformError::new(
                TransformStep::Parse,
                &name,
                "no column definitions found",
            ));
        }

        Ok(Self {
            name,
            columns,
            keys,
            options: sql[body_end + 1..].trim().to_string(),
        })
    }

    /// Render back to a `CREATE TABLE` statement.
    #[must_use]
    pub fn render(&self) -> String {
        let mut items: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                if c.definition.is_empty() {
                    quote_identifier(&c.name)
                } else {
                    format!("{} {}", quote_identifier(&c.name), c.definition)
                }
            })
            .collect();
        items.extend(self.keys.iter().cloned());

        let mut sql = format!(
            "CREATE TABLE {} (\n  {}\n)",
            quote_identifier(&self.name),
            items.join(",\n  ")
        );
        if !self.options.is_empty() {
            sql.push(' ');
            sql.push_str(&self.options);
        }
        sql
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Index of the `)` matching an already-consumed `(`, skipping quoted text.
fn find_closing_paren(sql: &str, from: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut quote: Option<u8> = None;
    let bytes = sql.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q != b'`' {
                    i += 1;
                } else if b == q {
                    if bytes.get(i + 1) == Some(&q) {
                        i += 1;
                    } else {
                        quote = None;
                    }
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Split a column/key list at commas outside parentheses and quotes.
fn split_top_level(body: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        match quote {
            Some(q) => {
                if c == '\\' && q != '`' {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                } else if c == q {
                    if chars.peek() == Some(&q) {
                        if let Some(next) = chars.next() {
                            current.push(next);
                        }
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    current.pop();
                    push_item(&mut items, &current);
                    current.clear();
                }
                _ => {}
            },
        }
    }
    push_item(&mut items, &current);
    items
}

fn push_item(items: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        items.push(trimmed.to_string());
    }
}

/// Split "name` rest" (leading backtick already stripped).
fn split_column(rest: &str) -> Option<(String, String)> {
    let mut name = String::new();
    let mut chars = rest.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '`' {
            if chars.peek().map(|(_, n)| *n) == Some('`') {
                chars.next();
                name.push('`');
                continue;
            }
            return Some((name, rest[i + 1..].trim().to_string()));
        }
        name.push(c);
    }
    None
}

pub fn strip_auto_increment(def: &mut TableDefinition) -> Result<(), TransformError> {
    for column in &mut def.columns {
        column.definition = AUTO_INCREMENT_COLUMN
            .replace_all(&column.definition, "")
            .into_owned();
    }
    def.options = AUTO_INCREMENT_OPTION
        .replace_all(&def.options, "")
        .trim()
        .to_string();
    Ok(())
}

pub fn strip_zero_dates(def: &mut TableDefinition) -> Result<(), TransformError> {
    for column in &mut def.columns {
        column.definition = ZERO_DATE_DEFAULT
            .replace_all(&column.definition, "")
            .into_owned();
    }
    Ok(())
}

/// Make every column nullable with a NULL default.
pub fn relax_not_null(def: &mut TableDefinition) -> Result<(), TransformError> {
    if def.columns.is_empty() {
        return Err(TransformError::new(
            TransformStep::RelaxNotNull,
            &def.name,
            "table has no columns",
        ));
    }
    for column in &mut def.columns {
        let stripped = DEFAULT_CLAUSE.replace_all(&column.definition, "");
        let stripped = ON_UPDATE_CLAUSE.replace_all(&stripped, "");
        let stripped = NOT_NULL.replace_all(&stripped, "");
        let stripped = NULLABLE.replace_all(&stripped, "");
        let stripped = stripped.trim();
        column.definition = if stripped.is_empty() {
            "NULL DEFAULT NULL".to_string()
        } else {
            format!("{stripped} NULL DEFAULT NULL")
        };
    }
    Ok(())
}

/// Replace all key and constraint clauses with the surrogate primary key.
pub fn replace_keys(def: &mut TableDefinition) -> Result<(), TransformError> {
    def.keys = vec![format!("PRIMARY KEY ({})", quote_identifier(ID_COLUMN))];
    Ok(())
}

pub fn rename(def: &mut TableDefinition, new_name: &str) -> Result<(), TransformError> {
    if new_name.is_empty() || new_name == def.name {
        return Err(TransformError::new(
            TransformStep::Rename,
            &def.name,
            format!("rename to '{new_name}' would not change the table name"),
        ));
    }
    def.name = new_name.to_string();
    Ok(())
}

/// Add the surrogate id and action columns in front of the copied columns.
pub fn prepend_journal_columns(def: &mut TableDefinition) -> Result<(), TransformError> {
    if let Some(clash) = def
        .columns
        .iter()
        .find(|c| c.name == ID_COLUMN || c.name == ACTION_COLUMN)
    {
        return Err(TransformError::new(
            TransformStep::PrependJournalColumns,
            &def.name,
            format!("column {} already exists", clash.name),
        ));
    }
    let mut columns = vec![
        ColumnDefinition {
            name: ID_COLUMN.to_string(),
            definition: "bigint unsigned NOT NULL AUTO_INCREMENT".to_string(),
        },
        ColumnDefinition {
            name: ACTION_COLUMN.to_string(),
            definition: "enum('INSERT','UPDATE','DELETE') NOT NULL".to_string(),
        },
    ];
    columns.append(&mut def.columns);
    def.columns = columns;
    Ok(())
}

/// Add one column per `key` column, with the same (relaxed) type, to hold
/// the key an UPDATE left the row under.
pub fn append_key_columns(def: &mut TableDefinition, key: &[String]) -> Result<(), TransformError> {
    let mut added = Vec::with_capacity(key.len());
    for (position, column) in key.iter().enumerate() {
        let source = def.columns.iter().find(|c| c.name == *column).ok_or_else(|| {
            TransformError::new(
                TransformStep::AppendKeyColumns,
                &def.name,
                format!("key column {column} is not a column of the table"),
            )
        })?;
        let name = new_key_column(position);
        if def.columns.iter().any(|c| c.name == name) {
            return Err(TransformError::new(
                TransformStep::AppendKeyColumns,
                &def.name,
                format!("column {name} already exists"),
            ));
        }
        added.push(ColumnDefinition {
            name,
            definition: source.definition.clone(),
        });
    }
    def.columns.extend(added);
    Ok(())
}

/// Run the full pipeline: source `CREATE TABLE` → journal `CREATE TABLE`.
pub fn journal_table_definition(
    create_sql: &str,
    journal_table: &str,
    key: &[String],
) -> Result<String, TransformError> {
    let mut def = TableDefinition::parse(create_sql)?;
    let table = def.name.clone();
    let tag = |mut e: TransformError| {
        e.table = table.clone();
        e
    };

    strip_auto_increment(&mut def).map_err(tag)?;
    strip_zero_dates(&mut def).map_err(tag)?;
    relax_not_null(&mut def).map_err(tag)?;
    replace_keys(&mut def).map_err(tag)?;
    rename(&mut def, journal_table).map_err(tag)?;
    prepend_journal_columns(&mut def).map_err(tag)?;
    append_key_columns(&mut def, key).map_err(tag)?;
    Ok(def.render())
}
