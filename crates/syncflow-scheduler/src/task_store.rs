//! Task Store operations: create, dequeue, heartbeat, terminal transitions,
//! the expiry sweep and search.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use std::collections::HashSet;
use syncflow_core::{OrchestratorError, Result};

use crate::persistence::{self, SchedulerDb, TASK_COLUMNS, insert_task, ms, task_from_row};
use crate::schedules::ScheduleState;
use crate::tasks::{
    DEFAULT_SEARCH_LIMIT, GroupKeyPattern, MAX_SEARCH_LIMIT, NewTask, Task, TaskFilter,
    TaskOutcome, TaskState, Transition,
};

impl SchedulerDb {
    /// Insert a CREATED task.
    ///
    /// Fails with `DuplicateTask(existing_id)` when another non-terminal task
    /// already holds the same owner key.
    pub fn create_task(&self, new: NewTask, now: DateTime<Utc>) -> Result<Task> {
        new.validate()?;
        self.write(|tx| {
            if let Some(owner_key) = &new.owner_key {
                if let Some(existing) = pending_owner(tx, owner_key)? {
                    return Err(OrchestratorError::DuplicateTask(existing));
                }
            }
            let task = Task::new(new, now);
            insert_task(tx, &task)?;
            Ok(task)
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        let conn = self.lock()?;
        load_task(&conn, task_id)
    }

    /// Lease up to `limit` tasks, at most one per group key, oldest first.
    ///
    /// A group is eligible when none of its tasks is STARTED and it has a
    /// CREATED task whose `starts_after` has passed. Selection and the state
    /// change happen in one IMMEDIATE transaction.
    pub fn dequeue(
        &self,
        groups: &[GroupKeyPattern],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        if groups.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut args = vec![SqlValue::Integer(ms(now))];
        let mut clauses = Vec::with_capacity(groups.len());
        for g in groups {
            match g {
                GroupKeyPattern::Exact(key) => {
                    clauses.push("group_key = ?");
                    args.push(SqlValue::Text(key.clone()));
                }
                GroupKeyPattern::Prefix(prefix) => {
                    clauses.push("group_key LIKE ? ESCAPE '\\'");
                    args.push(SqlValue::Text(persistence::like_prefix(prefix)));
                }
            }
        }
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t
             WHERE state = 'CREATED' AND starts_after <= ? AND ({})
               AND NOT EXISTS (
                   SELECT 1 FROM tasks s WHERE s.group_key = t.group_key AND s.state = 'STARTED'
               )
             ORDER BY created_at, rowid",
            clauses.join(" OR ")
        );

        self.write(|tx| {
            let candidates = {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), task_from_row)?;
                rows.collect::<rusqlite::Result<Vec<Task>>>()?
            };

            let mut seen = HashSet::new();
            let mut leased = Vec::new();
            for mut task in candidates {
                if leased.len() >= limit {
                    break;
                }
                if !seen.insert(task.group_key.clone()) {
                    continue;
                }
                let changed = tx.execute(
                    "UPDATE tasks SET state = 'STARTED', started_at = ?1, last_heartbeat_at = ?1
                     WHERE id = ?2 AND state = 'CREATED'",
                    rusqlite::params![ms(now), task.id],
                )?;
                if changed == 1 {
                    task.state = TaskState::Started;
                    task.started_at = Some(now);
                    task.last_heartbeat_at = Some(now);
                    leased.push(task);
                }
            }
            Ok(leased)
        })
    }

    /// Refresh the lease on a STARTED task.
    pub fn heartbeat(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        self.write(|tx| {
            let mut task = load_task(tx, task_id)?;
            match task.state {
                TaskState::Started => {
                    tx.execute(
                        "UPDATE tasks SET last_heartbeat_at = ?1 WHERE id = ?2 AND state = 'STARTED'",
                        rusqlite::params![ms(now), task_id],
                    )?;
                    task.last_heartbeat_at = Some(now);
                    Ok(task)
                }
                TaskState::Expired | TaskState::Cancelled => Err(OrchestratorError::LeaseLost(
                    format!("task {task_id} is {}", task.state),
                )),
                other => Err(OrchestratorError::InvalidTransition(format!(
                    "cannot heartbeat task {task_id} in state {other}"
                ))),
            }
        })
    }

    /// Move a task to a terminal state exactly once.
    ///
    /// Repeating the call with the same state and output is a no-op success.
    /// A retryable outcome with remaining budget enqueues the next attempt in
    /// the same transaction.
    pub fn transition_terminal(
        &self,
        task_id: &str,
        outcome: &TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        self.write(|tx| {
            let task = load_task(tx, task_id)?;
            terminate(tx, task, outcome, now)
        })
    }

    /// Sweep: expire every task whose state timeout has passed.
    ///
    /// Each task is handled in its own transaction; a failure on one is logged
    /// and the sweep moves on.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Transition>> {
        let candidates: Vec<String> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id FROM tasks
                 WHERE (state = 'CREATED'
                        AND MAX(created_at, starts_after) + created_to_started_timeout_ms < ?1)
                    OR (state = 'STARTED'
                        AND (COALESCE(last_heartbeat_at, started_at) + heartbeat_timeout_ms < ?1
                             OR started_at + started_to_completed_timeout_ms < ?1))
                 ORDER BY created_at, rowid",
            )?;
            let rows = stmt.query_map([ms(now)], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut expired = Vec::with_capacity(candidates.len());
        for task_id in candidates {
            match self.expire_task(&task_id, now) {
                Ok(Some(t)) => expired.push(t),
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Sweep skipped task {task_id}: {e}"),
            }
        }
        Ok(expired)
    }

    /// Expire one task if it is still stale. None when another caller got there first.
    fn expire_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<Option<Transition>> {
        self.write(|tx| {
            let task = load_task(tx, task_id)?;
            let Some(reason) = task.stale_reason(now) else {
                return Ok(None);
            };
            let t = terminate(tx, task, &TaskOutcome::expired(reason), now)?;
            tracing::info!(
                "⌛ Task {} expired ({}), retry: {}",
                task_id,
                reason.as_str(),
                t.retry.as_ref().map(|r| r.id.as_str()).unwrap_or("none")
            );
            Ok(Some(t))
        })
    }

    /// The most recent attempt of a logical unit of work.
    pub fn latest_attempt(&self, retry_key: &str) -> Result<Task> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE retry_key = ?1
                 ORDER BY retry_count DESC, created_at DESC LIMIT 1"
            ),
            [retry_key],
            task_from_row,
        )
        .optional()?
        .ok_or_else(|| OrchestratorError::NotFound(format!("task {retry_key}")))
    }

    /// Read-only query, oldest first.
    pub fn search_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            clauses.push(format!("id IN ({})", vec!["?"; ids.len()].join(", ")));
            args.extend(ids.iter().cloned().map(SqlValue::Text));
        }
        let eq = [
            ("group_key", filter.group_key.clone()),
            ("state", filter.state.map(|s| s.as_str().to_string())),
            ("schedule_id", filter.schedule_id.clone()),
            ("retry_key", filter.retry_key.clone()),
            ("owner_key", filter.owner_key.clone()),
        ];
        for (column, value) in eq {
            if let Some(v) = value {
                clauses.push(format!("{column} = ?"));
                args.push(SqlValue::Text(v));
            }
        }
        if let Some(after) = filter.created_after {
            clauses.push("created_at >= ?".into());
            args.push(SqlValue::Integer(ms(after)));
        }
        if let Some(before) = filter.created_before {
            clauses.push("created_at < ?".into());
            args.push(SqlValue::Integer(ms(before)));
        }
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        args.push(SqlValue::Integer(limit as i64));

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks {where_sql} ORDER BY created_at, rowid LIMIT ?"
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

pub(crate) fn load_task(conn: &Connection, task_id: &str) -> Result<Task> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        [task_id],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))
}

fn pending_owner(conn: &Connection, owner_key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM tasks WHERE owner_key = ?1 AND state IN ('CREATED', 'STARTED')",
            [owner_key],
            |r| r.get(0),
        )
        .optional()?)
}

/// Shared terminal-transition logic; runs inside the caller's transaction.
pub(crate) fn terminate(
    conn: &Connection,
    mut task: Task,
    outcome: &TaskOutcome,
    now: DateTime<Utc>,
) -> Result<Transition> {
    let next = outcome.state();
    if task.state.is_terminal() {
        if task.state == next && task.output.as_ref() == Some(outcome.output()) {
            return Ok(Transition {
                task,
                retry: None,
                changed: false,
            });
        }
        let reclaimed = matches!(task.state, TaskState::Expired | TaskState::Cancelled);
        let worker_report = matches!(next, TaskState::Succeeded | TaskState::Failed);
        if reclaimed && worker_report {
            return Err(OrchestratorError::LeaseLost(format!(
                "task {} is {}",
                task.id, task.state
            )));
        }
        return Err(OrchestratorError::AlreadyTerminal(format!(
            "task {} is already {}",
            task.id, task.state
        )));
    }
    if !task.state.can_transition_to(next) {
        return Err(OrchestratorError::InvalidTransition(format!(
            "task {} cannot move from {} to {}",
            task.id, task.state, next
        )));
    }

    let changed = conn.execute(
        "UPDATE tasks SET state = ?1, output = ?2, terminated_at = ?3 WHERE id = ?4 AND state = ?5",
        rusqlite::params![
            next.as_str(),
            outcome.output().to_string(),
            ms(now),
            task.id,
            task.state.as_str(),
        ],
    )?;
    if changed != 1 {
        return Err(OrchestratorError::StoreUnavailable(format!(
            "task {} changed concurrently",
            task.id
        )));
    }
    task.state = next;
    task.output = Some(outcome.output().clone());
    task.terminated_at = Some(now);

    let retry = if outcome.is_retryable() && task.can_retry() && !schedule_deleted(conn, &task)? {
        let attempt = task.next_attempt(now);
        insert_task(conn, &attempt)?;
        if let Some(schedule_id) = &attempt.schedule_id {
            // Keep the schedule's backlog guard pointed at the live attempt.
            conn.execute(
                "UPDATE schedules SET last_scheduled_task_id = ?1
                 WHERE id = ?2 AND last_scheduled_task_id = ?3",
                rusqlite::params![attempt.id, schedule_id, task.id],
            )?;
        }
        Some(attempt)
    } else {
        None
    };

    Ok(Transition {
        task,
        retry,
        changed: true,
    })
}

/// True when the task belongs to a schedule that has since been deleted.
fn schedule_deleted(conn: &Connection, task: &Task) -> Result<bool> {
    let Some(schedule_id) = &task.schedule_id else {
        return Ok(false);
    };
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM schedules WHERE id = ?1",
            [schedule_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(state.as_deref() == Some(ScheduleState::Deleted.as_str()))
}

/// Cancel every CREATED task of a schedule.
pub(crate) fn cancel_pending_for_schedule(
    conn: &Connection,
    schedule_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let pending: Vec<Task> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE schedule_id = ?1 AND state = 'CREATED'"
        ))?;
        let rows = stmt.query_map([schedule_id], task_from_row)?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    let outcome = TaskOutcome::Cancelled(serde_json::json!({"reason": "schedule_deleted"}));
    pending
        .into_iter()
        .map(|t| terminate(conn, t, &outcome, now).map(|tr| tr.task))
        .collect()
}
