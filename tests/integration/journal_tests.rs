use super::support::{user_names, JournalingSqlite};
use dbfixture::db::{Connection, Driver, SqlValue, SqliteDriver};
use dbfixture::journal::{
    journal_table_name, trigger_name, ChangeJournal, JournalAction, JournalError,
    CHANGE_TRACKER_TABLE, MAX_IDENTIFIER_LENGTH,
};
use dbfixture::reuse::ReuseRecord;
use std::path::Path;
use tempfile::tempdir;

fn seeded(dir: &Path) -> JournalingSqlite {
    let mut driver = JournalingSqlite::new(dir);
    driver.create_database("app").unwrap();
    let conn = driver.connection().unwrap();
    ReuseRecord::provisional("shop", "app", "b", "s")
        .save(conn)
        .unwrap();
    conn.direct_exec(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         INSERT INTO users (id, name) VALUES (1, 'ann'), (2, 'ben');",
    )
    .unwrap();
    driver
}

#[test]
fn test_set_up_journals_user_tables_once() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let journal = ChangeJournal::new(&driver).unwrap();

    assert_eq!(journal.set_up().unwrap(), vec!["users".to_string()]);
    assert!(driver.table_exists(CHANGE_TRACKER_TABLE).unwrap());
    assert!(driver.table_exists(&journal_table_name("users")).unwrap());

    // Reused databases are already journaled.
    assert!(journal.set_up().unwrap().is_empty());
}

#[test]
fn test_reverse_undoes_insert_update_delete() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let journal = ChangeJournal::new(&driver).unwrap();
    journal.set_up().unwrap();
    journal.record_start().unwrap();
    assert!(ReuseRecord::load(&driver).unwrap().unwrap().journal_dirty);

    let conn = driver.connection().unwrap();
    conn.insert("INSERT INTO users (id, name) VALUES (3, 'cy')", &[])
        .unwrap();
    conn.update("UPDATE users SET name = 'cyrus' WHERE id = 3", &[])
        .unwrap();
    conn.update("UPDATE users SET name = 'annie' WHERE id = 1", &[])
        .unwrap();
    conn.update("DELETE FROM users WHERE id IN (2, 3)", &[])
        .unwrap();
    assert_eq!(user_names(&driver), vec!["annie".to_string()]);

    let summary = journal.reverse().unwrap();
    assert_eq!(summary.tables, vec!["users".to_string()]);
    assert_eq!(summary.rows, 5);
    assert_eq!(
        user_names(&driver),
        vec!["ann".to_string(), "ben".to_string()]
    );

    // Journal and tracker are emptied, the record is clean again.
    let leftover = conn
        .select(
            &format!("SELECT * FROM `{}`", journal_table_name("users")),
            &[],
        )
        .unwrap();
    assert!(leftover.is_empty());
    assert!(!ReuseRecord::load(&driver).unwrap().unwrap().journal_dirty);
}

/// `id:name` pairs of `table`, by id.
fn rows(conn: &dyn Connection, table: &str) -> Vec<String> {
    conn.select(&format!("SELECT * FROM {table} ORDER BY id"), &[])
        .unwrap()
        .iter()
        .map(|row| {
            format!(
                "{}:{}",
                row.get("id").and_then(SqlValue::as_i64).unwrap(),
                row.get("name").and_then(SqlValue::to_text).unwrap()
            )
        })
        .collect()
}

#[test]
fn test_reverse_undoes_key_change() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let journal = ChangeJournal::new(&driver).unwrap();
    journal.set_up().unwrap();
    journal.record_start().unwrap();

    let conn = driver.connection().unwrap();
    conn.update("UPDATE users SET id = 10 WHERE id = 1", &[])
        .unwrap();
    conn.update("UPDATE users SET id = 20, name = 'benny' WHERE id = 2", &[])
        .unwrap();
    assert_eq!(rows(conn, "users"), vec!["10:ann", "20:benny"]);

    let summary = journal.reverse().unwrap();
    assert_eq!(summary.rows, 2);
    assert_eq!(rows(conn, "users"), vec!["1:ann", "2:ben"]);
}

#[test]
fn test_reverse_fails_when_updated_row_vanished_untracked() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let journal = ChangeJournal::new(&driver).unwrap();
    journal.set_up().unwrap();
    journal.record_start().unwrap();

    let conn = driver.connection().unwrap();
    conn.update("UPDATE users SET name = 'annie' WHERE id = 1", &[])
        .unwrap();
    conn.direct_exec(&format!(
        "DROP TRIGGER `{}`; DELETE FROM users WHERE id = 1;",
        trigger_name("users", JournalAction::Delete)
    ))
    .unwrap();

    let err = journal.reverse().unwrap_err();
    assert!(matches!(
        err,
        JournalError::RowMissing { ref table, action: JournalAction::Update } if table == "users"
    ));
    // Nothing was marked clean.
    assert!(ReuseRecord::load(&driver).unwrap().unwrap().journal_dirty);
}

#[test]
fn test_set_up_repairs_journal_without_triggers() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let conn = driver.connection().unwrap();
    // Left behind by a set-up that died after creating the journal table.
    conn.direct_exec(&format!(
        "CREATE TABLE `{}` (id, name)",
        journal_table_name("users")
    ))
    .unwrap();

    let journal = ChangeJournal::new(&driver).unwrap();
    assert_eq!(journal.set_up().unwrap(), vec!["users".to_string()]);
    assert!(journal.set_up().unwrap().is_empty());

    journal.record_start().unwrap();
    conn.insert("INSERT INTO users (id, name) VALUES (3, 'cy')", &[])
        .unwrap();
    assert_eq!(journal.reverse().unwrap().rows, 1);
    assert_eq!(
        user_names(&driver),
        vec!["ann".to_string(), "ben".to_string()]
    );
}

#[test]
fn test_set_up_repairs_missing_trigger() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let journal = ChangeJournal::new(&driver).unwrap();
    journal.set_up().unwrap();

    let conn = driver.connection().unwrap();
    conn.direct_exec(&format!(
        "DROP TRIGGER `{}`",
        trigger_name("users", JournalAction::Update)
    ))
    .unwrap();
    assert_eq!(journal.set_up().unwrap(), vec!["users".to_string()]);

    journal.record_start().unwrap();
    conn.update("UPDATE users SET name = 'annie' WHERE id = 1", &[])
        .unwrap();
    journal.reverse().unwrap();
    assert_eq!(rows(conn, "users"), vec!["1:ann", "2:ben"]);
}

#[test]
fn test_reverse_across_linked_tables_suspends_foreign_keys() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let conn = driver.connection().unwrap();
    conn.direct_exec(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE teams (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         CREATE TABLE members (
             id INTEGER PRIMARY KEY,
             team_id INTEGER NOT NULL REFERENCES teams (id),
             name TEXT NOT NULL
         );
         INSERT INTO teams (id, name) VALUES (1, 'red');
         INSERT INTO members (id, team_id, name) VALUES (1, 1, 'ann');",
    )
    .unwrap();
    let journal = ChangeJournal::new(&driver).unwrap();
    journal.set_up().unwrap();
    journal.record_start().unwrap();

    // Whichever table is reversed first, one step breaks a reference.
    conn.direct_exec(
        "DELETE FROM members WHERE id = 1;
         DELETE FROM teams WHERE id = 1;
         INSERT INTO teams (id, name) VALUES (3, 'blue');
         INSERT INTO members (id, team_id, name) VALUES (30, 3, 'cy');",
    )
    .unwrap();

    let summary = journal.reverse().unwrap();
    assert_eq!(summary.tables.len(), 2);
    assert_eq!(summary.rows, 4);
    assert_eq!(rows(conn, "teams"), vec!["1:red"]);
    assert_eq!(rows(conn, "members"), vec!["1:ann"]);

    let enabled = conn.select("PRAGMA foreign_keys", &[]).unwrap();
    assert_eq!(enabled[0].get_index(0).and_then(SqlValue::as_i64), Some(1));
    assert!(conn.select("PRAGMA foreign_key_check", &[]).unwrap().is_empty());
}

#[test]
fn test_long_table_names_are_journaled() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let table = "order_line_item_adjustment_history_entries_for_tests";
    let conn = driver.connection().unwrap();
    conn.direct_exec(&format!(
        "CREATE TABLE {table} (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"
    ))
    .unwrap();

    let journal = ChangeJournal::new(&driver).unwrap();
    journal.set_up().unwrap();
    let shadow = journal_table_name(table);
    assert_eq!(shadow.chars().count(), MAX_IDENTIFIER_LENGTH);
    assert!(driver.table_exists(&shadow).unwrap());
    assert!(journal.set_up().unwrap().is_empty());

    journal.record_start().unwrap();
    conn.insert(&format!("INSERT INTO {table} (id, name) VALUES (1, 'x')"), &[])
        .unwrap();
    assert_eq!(journal.reverse().unwrap().rows, 1);
    assert!(rows(conn, table).is_empty());
}

#[test]
fn test_reverse_with_nothing_changed_is_a_no_op() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let journal = ChangeJournal::new(&driver).unwrap();
    journal.set_up().unwrap();
    journal.record_start().unwrap();

    let summary = journal.reverse().unwrap();
    assert!(summary.is_empty());
    assert_eq!(summary.rows, 0);
    assert!(!ReuseRecord::load(&driver).unwrap().unwrap().journal_dirty);
}

#[test]
fn test_table_without_key_cannot_be_reversed() {
    let dir = tempdir().unwrap();
    let driver = seeded(dir.path());
    let conn = driver.connection().unwrap();
    conn.direct_exec("CREATE TABLE audit (message TEXT)").unwrap();
    let journal = ChangeJournal::new(&driver).unwrap();
    journal.set_up().unwrap();

    conn.insert("INSERT INTO audit (message) VALUES ('hello')", &[])
        .unwrap();
    let err = journal.reverse().unwrap_err();
    assert!(matches!(err, JournalError::NoPrimaryKey { ref table } if table == "audit"));
}

#[test]
fn test_plain_sqlite_driver_does_not_journal() {
    let dir = tempdir().unwrap();
    let mut driver = SqliteDriver::new(dir.path());
    driver.create_database("app").unwrap();
    assert!(matches!(
        ChangeJournal::new(&driver),
        Err(JournalError::Unsupported(_))
    ));
}
