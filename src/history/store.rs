// src/history/store.rs

//! SQLite-backed history of finished instances.
//!
//! One record per finished instance, keyed by (job_id, instance_id),
//! written exactly once when the instance reaches a terminal state.
//! Retention is enforced lazily as part of every write, in the same
//! transaction as the insert. All access is serialised through one
//! connection behind a mutex.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, Row, Transaction, params};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::job::instance::{InstanceSnapshot, Lifecycle, RunError, StateChange};
use crate::job::state::RunState;

use super::migrate;

/// Lazily enforced retention limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    /// Records whose `ended` is older than now − max_age are deleted.
    pub max_age: Option<chrono::Duration>,
    /// −1 disables the limit, 0 retains nothing, positive N keeps the N
    /// most-recently-ended records.
    pub max_records: i64,
}

impl RetentionPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_age: None,
            max_records: -1,
        }
    }
}

/// Durable table of finished instances.
pub struct HistoryStore {
    conn: Mutex<Connection>,
    retention: RetentionPolicy,
}

impl HistoryStore {
    /// Open (creating and migrating as needed) the database at `path`.
    pub fn open(path: &Path, retention: RetentionPolicy) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migrate::migrate(&mut conn)?;
        debug!(path = %path.display(), "history store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            retention,
        })
    }

    /// In-memory store, used in tests.
    pub fn open_in_memory(retention: RetentionPolicy) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention,
        })
    }

    /// Persist one terminal snapshot and run the retention sweep, all in
    /// one transaction.
    pub fn record(&self, snapshot: &InstanceSnapshot) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        insert_snapshot(&tx, snapshot)?;
        sweep(&tx, &self.retention)?;
        tx.commit()?;
        Ok(())
    }

    /// Read finished instances, most recently ended first, optionally
    /// filtered by job id. `limit` < 0 means no limit.
    pub fn read_instances(
        &self,
        job_filter: Option<&str>,
        limit: i64,
    ) -> Result<Vec<InstanceSnapshot>> {
        let conn = self.lock();
        let statement = match job_filter {
            Some(_) => {
                "SELECT job_id, instance_id, created, ended, exec_time, state_changes,
                        terminal_state, tracking, result, error_output, warnings, error,
                        user_params, parameters, misc
                 FROM history WHERE job_id = ?1 ORDER BY ended DESC LIMIT ?2"
            }
            None => {
                "SELECT job_id, instance_id, created, ended, exec_time, state_changes,
                        terminal_state, tracking, result, error_output, warnings, error,
                        user_params, parameters, misc
                 FROM history ORDER BY ended DESC LIMIT ?1"
            }
        };
        let mut stmt = conn.prepare(statement)?;
        let rows = match job_filter {
            Some(job_id) => stmt.query_map(params![job_id, limit], snapshot_from_row)?,
            None => stmt.query_map(params![limit], snapshot_from_row)?,
        };
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    /// Number of retained records.
    pub fn count(&self) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row("SELECT count(*) FROM history", [], |row| row.get(0))?;
        Ok(count)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn insert_snapshot(tx: &Transaction<'_>, snapshot: &InstanceSnapshot) -> Result<()> {
    let exec_time = snapshot
        .exec_time()
        .map(|d| (d.num_milliseconds() as f64) / 1000.0);
    // Terminal snapshots are the only ones recorded; a non-terminal state
    // here would be a caller bug, stored defensively as UNKNOWN.
    let terminal_state = if snapshot.state.is_terminal() {
        snapshot.state
    } else {
        RunState::Unknown
    };
    tx.execute(
        "INSERT INTO history VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            snapshot.job_id,
            snapshot.instance_id,
            format_ts(snapshot.created),
            snapshot.ended.map(format_ts),
            exec_time,
            json_column(snapshot.lifecycle.changes())?,
            terminal_state.as_str(),
            snapshot.tracking,
            snapshot.result,
            optional_json(&snapshot.error_output)?,
            optional_json(&snapshot.warnings)?,
            snapshot
                .error
                .as_ref()
                .map(|e| json_column(e))
                .transpose()?,
            optional_json_map(&snapshot.user_params)?,
            optional_json_map(&snapshot.parameters)?,
            optional_json_map(&snapshot.misc)?,
        ],
    )?;
    Ok(())
}

/// Delete rows falling outside the retention policy. Runs inside the
/// write transaction so a record and its sweep land atomically.
fn sweep(tx: &Transaction<'_>, policy: &RetentionPolicy) -> Result<()> {
    if let Some(max_age) = policy.max_age {
        let cutoff = format_ts(Utc::now() - max_age);
        let deleted = tx.execute("DELETE FROM history WHERE ended < ?1", params![cutoff])?;
        if deleted > 0 {
            debug!(deleted, %cutoff, "retention removed aged-out records");
        }
    }
    if policy.max_records >= 0 {
        let deleted = tx.execute(
            "DELETE FROM history WHERE rowid NOT IN
             (SELECT rowid FROM history ORDER BY ended DESC LIMIT ?1)",
            params![policy.max_records],
        )?;
        if deleted > 0 {
            debug!(deleted, limit = policy.max_records, "retention removed excess records");
        }
    }
    Ok(())
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<InstanceSnapshot> {
    let created: Option<String> = row.get(2)?;
    let ended: Option<String> = row.get(3)?;
    let state_changes: Option<String> = row.get(5)?;
    let terminal_state: String = row.get(6)?;
    let error_output: Option<String> = row.get(9)?;
    let warnings: Option<String> = row.get(10)?;
    let error: Option<String> = row.get(11)?;
    let user_params: Option<String> = row.get(12)?;
    let parameters: Option<String> = row.get(13)?;
    let misc: Option<String> = row.get(14)?;

    let lifecycle = state_changes
        .as_deref()
        .map(parse_state_changes)
        .unwrap_or_default();
    // Unrecognised names (written by a newer schema) read as UNKNOWN.
    let state = terminal_state
        .parse()
        .unwrap_or(RunState::Unknown);

    Ok(InstanceSnapshot {
        job_id: row.get(0)?,
        instance_id: row.get(1)?,
        created: created
            .as_deref()
            .and_then(parse_ts)
            .unwrap_or(DateTime::UNIX_EPOCH),
        ended: ended.as_deref().and_then(parse_ts),
        state,
        lifecycle,
        tracking: row.get(7)?,
        result: row.get(8)?,
        error_output: parse_json_or_default(error_output.as_deref()),
        warnings: parse_json_or_default(warnings.as_deref()),
        error: error
            .as_deref()
            .and_then(|s| serde_json::from_str::<RunError>(s).ok()),
        user_params: parse_json_or_default(user_params.as_deref()),
        parameters: parse_json_or_default(parameters.as_deref()),
        // Records that predate the misc column read back as empty.
        misc: parse_json_or_default(misc.as_deref()),
        // The history schema has no latch column; latch state isn't persisted.
        latch: None,
    })
}

fn json_column<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value).context("serialising history column")?)
}

fn optional_json<T: serde::Serialize>(values: &[T]) -> Result<Option<String>> {
    if values.is_empty() {
        Ok(None)
    } else {
        Ok(Some(json_column(&values)?))
    }
}

fn optional_json_map<V: serde::Serialize>(map: &BTreeMap<String, V>) -> Result<Option<String>> {
    if map.is_empty() {
        Ok(None)
    } else {
        Ok(Some(json_column(map)?))
    }
}

fn parse_json_or_default<T: serde::de::DeserializeOwned + Default>(value: Option<&str>) -> T {
    match value {
        None => T::default(),
        Some(s) => serde_json::from_str(s).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable history column; using default");
            T::default()
        }),
    }
}

/// Parse the state_changes column, accepting both the current
/// `[{state, at, ..}]` form and the legacy `[["STATE", epoch], ..]` pairs
/// found in migrated rows.
fn parse_state_changes(raw: &str) -> Lifecycle {
    if let Ok(changes) = serde_json::from_str::<Vec<StateChange>>(raw) {
        return Lifecycle::from_changes(changes);
    }
    if let Ok(pairs) = serde_json::from_str::<Vec<(String, f64)>>(raw) {
        let changes = pairs
            .into_iter()
            .filter_map(|(state, epoch)| {
                let at = DateTime::from_timestamp(
                    epoch.trunc() as i64,
                    (epoch.fract() * 1e9) as u32,
                )?;
                Some(StateChange {
                    state: state.parse().unwrap_or(RunState::Unknown),
                    at,
                    exit_code: None,
                })
            })
            .collect();
        return Lifecycle::from_changes(changes);
    }
    warn!("unreadable state_changes column; returning empty lifecycle");
    Lifecycle::default()
}

/// Canonical timestamp form: UTC, no offset suffix, millisecond precision.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Parse the canonical form; tolerates RFC 3339 with a fixed offset (as
/// written by older tooling) by normalising to UTC.
fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trip_is_canonical() {
        let ts = Utc::now();
        let formatted = format_ts(ts);
        assert!(!formatted.contains('+'), "no offset suffix: {formatted}");
        let parsed = parse_ts(&formatted).expect("parse");
        assert!((ts - parsed).num_milliseconds().abs() <= 1);
    }

    #[test]
    fn rfc3339_offset_suffix_is_normalised() {
        let parsed = parse_ts("2023-06-01T12:30:00.500+00:00").expect("parse");
        assert_eq!(format_ts(parsed), "2023-06-01 12:30:00.500");
        let offset = parse_ts("2023-06-01T14:30:00.500+02:00").expect("parse");
        assert_eq!(offset, parsed);
    }

    #[test]
    fn legacy_state_change_pairs_parse() {
        let lifecycle =
            parse_state_changes("[[\"CREATED\", 1672567200.0], [\"COMPLETED\", 1672567500.5]]");
        let changes = lifecycle.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].state, RunState::Created);
        assert_eq!(changes[1].state, RunState::Completed);
        assert!(changes[0].at < changes[1].at);
    }

    #[test]
    fn garbage_state_changes_yield_empty_lifecycle() {
        let lifecycle = parse_state_changes("{not json");
        assert!(lifecycle.changes().is_empty());
        assert_eq!(lifecycle.state(), RunState::None);
    }
}
