//! SQLite-backed Task/Schedule store.
//!
//! The database is the single source of truth. Every state change runs inside an
//! `IMMEDIATE` transaction, so concurrent callers (threads of this process or
//! other processes sharing the file) serialize on the write lock. The partial
//! unique index on `tasks(group_key) WHERE state = 'STARTED'` backs the
//! one-lease-per-group invariant at the schema level.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use syncflow_core::{OrchestratorError, Result};

use crate::schedules::Schedule;
use crate::tasks::{Task, TaskPolicy};

/// SQLite-backed persistence store for tasks and schedules.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

pub(crate) const TASK_COLUMNS: &str = "id, name, group_key, schedule_id, retry_key, owner_key, \
    payload, state, retry_count, retry_max, created_to_started_timeout_ms, \
    started_to_completed_timeout_ms, heartbeat_timeout_ms, created_at, starts_after, \
    started_at, last_heartbeat_at, terminated_at, output";

pub(crate) const SCHEDULE_COLUMNS: &str = "id, name, group_key, state, frequency_ms, \
    payload_template, retry_max, created_to_started_timeout_ms, \
    started_to_completed_timeout_ms, heartbeat_timeout_ms, last_scheduled_task_id, \
    next_due_at, created_at, updated_at";

impl SchedulerDb {
    /// Open or create the store. `busy_timeout` bounds how long a statement
    /// waits on another writer before failing with `StoreUnavailable`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL lets readers proceed while a writer holds the lock.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                group_key TEXT NOT NULL,
                schedule_id TEXT,
                retry_key TEXT NOT NULL,
                owner_key TEXT,
                payload TEXT NOT NULL,           -- opaque JSON
                state TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_max INTEGER NOT NULL DEFAULT 0,
                created_to_started_timeout_ms INTEGER NOT NULL,
                started_to_completed_timeout_ms INTEGER NOT NULL,
                heartbeat_timeout_ms INTEGER NOT NULL,
                created_at INTEGER NOT NULL,     -- epoch millis
                starts_after INTEGER NOT NULL,
                started_at INTEGER,
                last_heartbeat_at INTEGER,
                terminated_at INTEGER,
                output TEXT
            );

            -- At most one leased task per group key.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_group_started
                ON tasks(group_key) WHERE state = 'STARTED';

            -- At most one pending task per idempotency key.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_owner_pending
                ON tasks(owner_key)
                WHERE owner_key IS NOT NULL AND state IN ('CREATED', 'STARTED');

            CREATE INDEX IF NOT EXISTS idx_tasks_dequeue
                ON tasks(state, group_key, starts_after, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_schedule ON tasks(schedule_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_retry_key ON tasks(retry_key);

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                group_key TEXT NOT NULL,
                state TEXT NOT NULL,
                frequency_ms INTEGER NOT NULL,
                payload_template TEXT NOT NULL,
                retry_max INTEGER NOT NULL DEFAULT 0,
                created_to_started_timeout_ms INTEGER NOT NULL,
                started_to_completed_timeout_ms INTEGER NOT NULL,
                heartbeat_timeout_ms INTEGER NOT NULL,
                last_scheduled_task_id TEXT,
                next_due_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(state, next_due_at);
            ",
        )?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("Lock: {e}")))
    }

    /// Run `f` inside an IMMEDIATE transaction; commit on Ok, roll back on Err.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// ─── Row mapping ──────────────────────────────────────

pub(crate) fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(raw).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(raw) => DateTime::from_timestamp_millis(raw)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, raw)),
        None => Ok(None),
    }
}

fn json(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = OrchestratorError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn policy(row: &Row<'_>, first: usize) -> rusqlite::Result<TaskPolicy> {
    Ok(TaskPolicy {
        retry_max: row.get(first)?,
        created_to_started_timeout_ms: row.get::<_, i64>(first + 1)? as u64,
        started_to_completed_timeout_ms: row.get::<_, i64>(first + 2)? as u64,
        heartbeat_timeout_ms: row.get::<_, i64>(first + 3)? as u64,
    })
}

/// Map a row selected with [`TASK_COLUMNS`].
pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let output = match row.get::<_, Option<String>>(18)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| conversion_err(18, e))?),
        None => None,
    };
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        group_key: row.get(2)?,
        schedule_id: row.get(3)?,
        retry_key: row.get(4)?,
        owner_key: row.get(5)?,
        payload: json(row, 6)?,
        state: parsed(row, 7)?,
        retry_count: row.get(8)?,
        policy: policy(row, 9)?,
        created_at: ts(row, 13)?,
        starts_after: ts(row, 14)?,
        started_at: opt_ts(row, 15)?,
        last_heartbeat_at: opt_ts(row, 16)?,
        terminated_at: opt_ts(row, 17)?,
        output,
    })
}

/// Map a row selected with [`SCHEDULE_COLUMNS`].
pub(crate) fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        group_key: row.get(2)?,
        state: parsed(row, 3)?,
        frequency_ms: row.get::<_, i64>(4)? as u64,
        payload_template: json(row, 5)?,
        policy: policy(row, 6)?,
        last_scheduled_task_id: row.get(10)?,
        next_due_at: ts(row, 11)?,
        created_at: ts(row, 12)?,
        updated_at: ts(row, 13)?,
    })
}

pub(crate) fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        rusqlite::params![
            task.id,
            task.name,
            task.group_key,
            task.schedule_id,
            task.retry_key,
            task.owner_key,
            task.payload.to_string(),
            task.state.as_str(),
            task.retry_count,
            task.policy.retry_max,
            task.policy.created_to_started_timeout_ms as i64,
            task.policy.started_to_completed_timeout_ms as i64,
            task.policy.heartbeat_timeout_ms as i64,
            ms(task.created_at),
            ms(task.starts_after),
            task.started_at.map(ms),
            task.last_heartbeat_at.map(ms),
            task.terminated_at.map(ms),
            task.output.as_ref().map(|o| o.to_string()),
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_schedule(conn: &Connection, s: &Schedule) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO schedules ({SCHEDULE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        rusqlite::params![
            s.id,
            s.name,
            s.group_key,
            s.state.as_str(),
            s.frequency_ms as i64,
            s.payload_template.to_string(),
            s.policy.retry_max,
            s.policy.created_to_started_timeout_ms as i64,
            s.policy.started_to_completed_timeout_ms as i64,
            s.policy.heartbeat_timeout_ms as i64,
            s.last_scheduled_task_id,
            ms(s.next_due_at),
            ms(s.created_at),
            ms(s.updated_at),
        ],
    )?;
    Ok(())
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` prefix match.
pub(crate) fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}
