// src/history/migrate.rs

//! Schema migration for the history database.
//!
//! The schema version lives in `PRAGMA user_version`. Each migration step
//! rebuilds the table in the target shape (create the new table, copy and
//! transform the rows, drop the old table, rename) inside one transaction
//! together with the version bump, so a crash mid-migration leaves the
//! previous schema fully intact. Re-running against an up-to-date database
//! is a no-op.
//!
//! Versions:
//! - v1 (legacy): history without `exec_time`, `terminal_state` and
//!   `misc`, written before versioning was introduced (`user_version` 0).
//! - v2 (current): the full column set of §schema below.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 2;

const CREATE_HISTORY_V2: &str = "CREATE TABLE history
     (job_id text,
     instance_id text,
     created timestamp,
     ended timestamp,
     exec_time real,
     state_changes text,
     terminal_state text,
     tracking text,
     result text,
     error_output text,
     warnings text,
     error text,
     user_params text,
     parameters text,
     misc text)";

/// Bring the database to [`SCHEMA_VERSION`].
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let version = user_version(conn)?;
    if version >= SCHEMA_VERSION {
        debug!(version, "history schema up to date");
        return Ok(());
    }

    let tx = conn.transaction()?;
    if history_table_exists(&tx)? {
        // A table without a recorded version is the legacy v1 layout.
        info!(from = version.max(1), to = SCHEMA_VERSION, "migrating history schema");
        migrate_v1_to_v2(&tx)?;
    } else {
        debug!("creating history table");
        tx.execute(CREATE_HISTORY_V2, [])?;
    }
    create_indexes(&tx)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

/// v1 -> v2: add `exec_time`, `terminal_state` and `misc`.
///
/// Legacy rows predate terminal-state tracking, so they get the
/// `UNKNOWN` default; every other column value is carried over unchanged.
fn migrate_v1_to_v2(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    tx.execute(
        "CREATE TABLE history_migrated
         (job_id text,
         instance_id text,
         created timestamp,
         ended timestamp,
         exec_time real,
         state_changes text,
         terminal_state text,
         tracking text,
         result text,
         error_output text,
         warnings text,
         error text,
         user_params text,
         parameters text,
         misc text)",
        [],
    )?;
    tx.execute(
        "INSERT INTO history_migrated
         (job_id, instance_id, created, ended, exec_time, state_changes,
          terminal_state, tracking, result, error_output, warnings, error,
          user_params, parameters, misc)
         SELECT job_id, instance_id, created, ended, NULL, state_changes,
                'UNKNOWN', tracking, result, error_output, warnings, error,
                user_params, parameters, NULL
         FROM history",
        [],
    )?;
    tx.execute("DROP TABLE history", [])?;
    tx.execute("ALTER TABLE history_migrated RENAME TO history", [])?;
    Ok(())
}

fn create_indexes(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    tx.execute(
        "CREATE INDEX IF NOT EXISTS job_id_index ON history (job_id)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS instance_id_index ON history (instance_id)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS ended_index ON history (ended)",
        [],
    )?;
    Ok(())
}

fn history_table_exists(tx: &rusqlite::Transaction<'_>) -> Result<bool> {
    let count: i64 = tx.query_row(
        "SELECT count(name) FROM sqlite_master WHERE type='table' AND name='history'",
        [],
        |row| row.get(0),
    )?;
    Ok(count == 1)
}

fn user_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a legacy v1 database by hand.
    fn legacy_db() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        conn.execute(
            "CREATE TABLE history
             (job_id text,
             instance_id text,
             created timestamp,
             ended timestamp,
             state_changes text,
             tracking text,
             result text,
             error_output text,
             warnings text,
             error text,
             user_params text,
             parameters text)",
            [],
        )
        .expect("create legacy table");
        conn.execute(
            "INSERT INTO history VALUES
             ('backup', 'i-1', '2023-01-01 10:00:00.000', '2023-01-01 10:05:00.000',
              '[[\"CREATED\", 1672567200.0], [\"RUNNING\", 1672567201.0], [\"COMPLETED\", 1672567500.0]]',
              NULL, 'ok', NULL, NULL, NULL, NULL, NULL)",
            [],
        )
        .expect("insert legacy row");
        conn
    }

    #[test]
    fn fresh_database_gets_current_schema() {
        let mut conn = Connection::open_in_memory().expect("in-memory db");
        migrate(&mut conn).expect("migrate");

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);

        // The misc column exists and is selectable.
        let misc: Option<String> = conn
            .query_row("SELECT misc FROM history LIMIT 1", [], |row| row.get(0))
            .unwrap_or(None);
        assert!(misc.is_none());
    }

    #[test]
    fn legacy_rows_get_unknown_terminal_state_and_keep_values() {
        let mut conn = legacy_db();
        migrate(&mut conn).expect("migrate");

        let (job_id, terminal_state, result, exec_time, misc): (
            String,
            String,
            Option<String>,
            Option<f64>,
            Option<String>,
        ) = conn
            .query_row(
                "SELECT job_id, terminal_state, result, exec_time, misc FROM history",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .expect("read migrated row");

        assert_eq!(job_id, "backup");
        assert_eq!(terminal_state, "UNKNOWN");
        assert_eq!(result.as_deref(), Some("ok"));
        assert!(exec_time.is_none());
        assert!(misc.is_none());
    }

    #[test]
    fn migration_is_idempotent() {
        let mut conn = legacy_db();
        migrate(&mut conn).expect("first migration");
        migrate(&mut conn).expect("second migration is a no-op");

        let count: i64 = conn
            .query_row("SELECT count(*) FROM history", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }
}
