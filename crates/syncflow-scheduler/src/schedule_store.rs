//! Schedule Store operations.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use syncflow_core::{OrchestratorError, Result};

use crate::persistence::{
    SCHEDULE_COLUMNS, SchedulerDb, insert_schedule, insert_task, ms, schedule_from_row,
};
use crate::schedules::{NewSchedule, Schedule, ScheduleFilter, SchedulePatch, ScheduleState};
use crate::task_store::cancel_pending_for_schedule;
use crate::tasks::{DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT, Task};

impl SchedulerDb {
    pub fn create_schedule(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<Schedule> {
        new.validate()?;
        let schedule = Schedule::new(new, now);
        self.write(|tx| insert_schedule(tx, &schedule))?;
        Ok(schedule)
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Result<Schedule> {
        let conn = self.lock()?;
        load_schedule(&conn, schedule_id)
    }

    /// Edit a schedule. Deleting also cancels the schedule's CREATED tasks,
    /// which are returned alongside the updated schedule. In-flight STARTED
    /// tasks are left to finish.
    pub fn update_schedule(
        &self,
        schedule_id: &str,
        patch: &SchedulePatch,
        now: DateTime<Utc>,
    ) -> Result<(Schedule, Vec<Task>)> {
        self.write(|tx| {
            let mut schedule = load_schedule(tx, schedule_id)?;
            let deleted = schedule.apply(patch, now)?;
            save_schedule(tx, &schedule)?;
            let cancelled = if deleted {
                cancel_pending_for_schedule(tx, schedule_id, now)?
            } else {
                Vec::new()
            };
            Ok((schedule, cancelled))
        })
    }

    /// STARTED schedules that are due and whose last materialized task is
    /// terminal (or gone). Rows that cannot be decoded are logged and skipped.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.lock()?;
        let columns = prefixed("s", SCHEDULE_COLUMNS);
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns} FROM schedules s
             LEFT JOIN tasks t ON t.id = s.last_scheduled_task_id
             WHERE s.state = 'STARTED' AND s.next_due_at <= ?1
               AND (t.id IS NULL OR t.state NOT IN ('CREATED', 'STARTED'))
             ORDER BY s.next_due_at, s.rowid"
        ))?;
        let rows = stmt.query_map([ms(now)], schedule_from_row)?;
        let mut due = Vec::new();
        for row in rows {
            match row.map_err(OrchestratorError::from) {
                Ok(schedule) => due.push(schedule),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable schedule row: {e}"),
            }
        }
        Ok(due)
    }

    /// Materialize one run of a due schedule.
    ///
    /// Every condition from [`due_schedules`](Self::due_schedules) is checked
    /// again inside the transaction, so concurrent scheduler replicas produce
    /// at most one task per period. Returns None when there is nothing to do.
    pub fn materialize_due(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        self.write(|tx| {
            let schedule = load_schedule(tx, schedule_id)?;
            if schedule.state != ScheduleState::Started
                || schedule.next_due_at > now
                || outstanding_task(tx, &schedule)?.is_some()
            {
                return Ok(None);
            }
            let next_due = schedule.next_due_after(now);
            materialize(tx, schedule, next_due, now).map(Some)
        })
    }

    /// "Run now": materialize immediately and restart the cadence from `now`.
    ///
    /// Subject to the same backlog guard as the regular cadence; a schedule
    /// whose previous task is still outstanding is rejected.
    pub fn trigger_now(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<Task> {
        self.write(|tx| {
            let schedule = load_schedule(tx, schedule_id)?;
            if schedule.state != ScheduleState::Started {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "schedule {schedule_id} is {}",
                    schedule.state
                )));
            }
            if let Some(task_id) = outstanding_task(tx, &schedule)? {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "schedule {schedule_id} already has outstanding task {task_id}"
                )));
            }
            let next_due = now + schedule.frequency();
            materialize(tx, schedule, next_due, now)
        })
    }

    pub fn search_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        for (column, values) in [("id", &filter.ids), ("name", &filter.names)] {
            if let Some(values) = values {
                if values.is_empty() {
                    return Ok(Vec::new());
                }
                clauses.push(format!("{column} IN ({})", vec!["?"; values.len()].join(", ")));
                args.extend(values.iter().cloned().map(SqlValue::Text));
            }
        }
        if let Some(state) = filter.state {
            clauses.push("state = ?".into());
            args.push(SqlValue::Text(state.as_str().into()));
        }
        if let Some(group_key) = &filter.group_key {
            clauses.push("group_key = ?".into());
            args.push(SqlValue::Text(group_key.clone()));
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
            "SELECT {SCHEDULE_COLUMNS} FROM schedules {where_sql} ORDER BY created_at, rowid LIMIT ?"
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), schedule_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn load_schedule(conn: &Connection, schedule_id: &str) -> Result<Schedule> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
        [schedule_id],
        schedule_from_row,
    )
    .optional()?
    .ok_or_else(|| OrchestratorError::NotFound(format!("schedule {schedule_id}")))
}

fn save_schedule(conn: &Connection, s: &Schedule) -> Result<()> {
    conn.execute(
        "UPDATE schedules SET state = ?1, frequency_ms = ?2, payload_template = ?3,
             retry_max = ?4, created_to_started_timeout_ms = ?5,
             started_to_completed_timeout_ms = ?6, heartbeat_timeout_ms = ?7,
             last_scheduled_task_id = ?8, next_due_at = ?9, updated_at = ?10
         WHERE id = ?11",
        rusqlite::params![
            s.state.as_str(),
            s.frequency_ms as i64,
            s.payload_template.to_string(),
            s.policy.retry_max,
            s.policy.created_to_started_timeout_ms as i64,
            s.policy.started_to_completed_timeout_ms as i64,
            s.policy.heartbeat_timeout_ms as i64,
            s.last_scheduled_task_id,
            ms(s.next_due_at),
            ms(s.updated_at),
            s.id,
        ],
    )?;
    Ok(())
}

/// Id of the schedule's last task when that task is not yet terminal.
fn outstanding_task(conn: &Connection, schedule: &Schedule) -> Result<Option<String>> {
    let Some(last) = &schedule.last_scheduled_task_id else {
        return Ok(None);
    };
    Ok(conn
        .query_row(
            "SELECT id FROM tasks WHERE id = ?1 AND state IN ('CREATED', 'STARTED')",
            [last],
            |r| r.get(0),
        )
        .optional()?)
}

fn materialize(
    conn: &Connection,
    mut schedule: Schedule,
    next_due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = Task::new(schedule.materialize(), now);
    insert_task(conn, &task)?;
    schedule.last_scheduled_task_id = Some(task.id.clone());
    schedule.next_due_at = next_due;
    schedule.updated_at = now;
    save_schedule(conn, &schedule)?;
    Ok(task)
}

/// Qualify each column of a list with a table alias.
fn prefixed(alias: &str, columns: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{GroupKeyPattern, TaskFilter, TaskOutcome, TaskState};
    use serde_json::json;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn db() -> SchedulerDb {
        SchedulerDb::open_in_memory().unwrap()
    }

    fn new_schedule(db: &SchedulerDb) -> Schedule {
        db.create_schedule(
            NewSchedule::new("sync-users", "acme:github:sync-users", 60_000, json!({"sync": "users"})),
            at(0),
        )
        .unwrap()
    }

    fn finish(db: &SchedulerDb, task: &Task, now: i64) {
        let key = vec![GroupKeyPattern::Exact(task.group_key.clone())];
        db.dequeue(&key, 1, at(now)).unwrap();
        db.transition_terminal(&task.id, &TaskOutcome::Succeeded(json!({})), at(now))
            .unwrap();
    }

    #[test]
    fn test_create_and_get() {
        let db = db();
        let s = new_schedule(&db);
        assert_eq!(db.get_schedule(&s.id).unwrap(), s);
        assert_eq!(db.get_schedule("nope").unwrap_err().code(), "not_found");
        assert!(
            db.create_schedule(NewSchedule::new("x", "g", 10, json!(null)), at(0))
                .is_err()
        );
    }

    #[test]
    fn test_materialize_advances_cadence() {
        let db = db();
        let s = new_schedule(&db);
        assert_eq!(db.due_schedules(at(0)).unwrap().len(), 1);
        let task = db.materialize_due(&s.id, at(0)).unwrap().unwrap();
        assert_eq!(task.schedule_id.as_deref(), Some(s.id.as_str()));
        assert_eq!(task.payload, json!({"sync": "users"}));

        let s = db.get_schedule(&s.id).unwrap();
        assert_eq!(s.last_scheduled_task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(s.next_due_at, at(60_000));
        // Not due again yet.
        assert!(db.materialize_due(&s.id, at(1)).unwrap().is_none());
    }

    #[test]
    fn test_backlog_guard_blocks_until_previous_task_terminates() {
        let db = db();
        let s = new_schedule(&db);
        let first = db.materialize_due(&s.id, at(0)).unwrap().unwrap();

        // Way past due, but the first task is still outstanding.
        assert!(db.due_schedules(at(600_000)).unwrap().is_empty());
        assert!(db.materialize_due(&s.id, at(600_000)).unwrap().is_none());

        finish(&db, &first, 600_001);
        assert_eq!(db.due_schedules(at(600_002)).unwrap().len(), 1);
        let second = db.materialize_due(&s.id, at(600_002)).unwrap().unwrap();
        assert_ne!(second.id, first.id);
        // Missed periods are not replayed.
        assert_eq!(db.get_schedule(&s.id).unwrap().next_due_at, at(660_002));
        assert!(db.materialize_due(&s.id, at(600_003)).unwrap().is_none());
    }

    #[test]
    fn test_paused_schedule_is_not_materialized() {
        let db = db();
        let s = new_schedule(&db);
        let pause = SchedulePatch {
            state: Some(ScheduleState::Paused),
            ..Default::default()
        };
        db.update_schedule(&s.id, &pause, at(1)).unwrap();
        assert!(db.due_schedules(at(10)).unwrap().is_empty());
        assert!(db.materialize_due(&s.id, at(10)).unwrap().is_none());

        let resume = SchedulePatch {
            state: Some(ScheduleState::Started),
            ..Default::default()
        };
        db.update_schedule(&s.id, &resume, at(20)).unwrap();
        assert!(db.materialize_due(&s.id, at(20)).unwrap().is_some());
    }

    #[test]
    fn test_delete_cancels_pending_tasks() {
        let db = db();
        let s = new_schedule(&db);
        let task = db.materialize_due(&s.id, at(0)).unwrap().unwrap();
        let delete = SchedulePatch {
            state: Some(ScheduleState::Deleted),
            ..Default::default()
        };
        let (deleted, cancelled) = db.update_schedule(&s.id, &delete, at(5)).unwrap();
        assert_eq!(deleted.state, ScheduleState::Deleted);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, task.id);
        assert_eq!(db.get_task(&task.id).unwrap().state, TaskState::Cancelled);

        // Deleted is final.
        let (again, none) = db.update_schedule(&s.id, &delete, at(6)).unwrap();
        assert_eq!(again.state, ScheduleState::Deleted);
        assert!(none.is_empty());
        let resume = SchedulePatch {
            state: Some(ScheduleState::Started),
            ..Default::default()
        };
        assert_eq!(
            db.update_schedule(&s.id, &resume, at(7)).unwrap_err().code(),
            "invalid_transition"
        );
        assert!(db.trigger_now(&s.id, at(8)).is_err());
    }

    #[test]
    fn test_delete_leaves_started_task_running() {
        let db = db();
        let s = new_schedule(&db);
        let task = db.materialize_due(&s.id, at(0)).unwrap().unwrap();
        db.dequeue(&[GroupKeyPattern::Exact(task.group_key.clone())], 1, at(1))
            .unwrap();
        let delete = SchedulePatch {
            state: Some(ScheduleState::Deleted),
            ..Default::default()
        };
        let (_, cancelled) = db.update_schedule(&s.id, &delete, at(2)).unwrap();
        assert!(cancelled.is_empty());
        assert_eq!(db.get_task(&task.id).unwrap().state, TaskState::Started);
    }

    #[test]
    fn test_trigger_now_resets_cadence_and_respects_guard() {
        let db = db();
        let s = new_schedule(&db);
        let first = db.trigger_now(&s.id, at(10)).unwrap();
        assert_eq!(db.get_schedule(&s.id).unwrap().next_due_at, at(60_010));

        let err = db.trigger_now(&s.id, at(20)).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");

        finish(&db, &first, 30);
        let second = db.trigger_now(&s.id, at(40)).unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(db.get_schedule(&s.id).unwrap().next_due_at, at(60_040));
        assert_eq!(db.trigger_now("nope", at(41)).unwrap_err().code(), "not_found");
    }

    #[test]
    fn test_retry_of_scheduled_task_keeps_guard() {
        let db = db();
        let mut new = NewSchedule::new("sync", "g", 60_000, json!({}));
        new.policy.retry_max = 1;
        let s = db.create_schedule(new, at(0)).unwrap();
        let task = db.materialize_due(&s.id, at(0)).unwrap().unwrap();
        db.dequeue(&[GroupKeyPattern::Exact("g".into())], 1, at(1)).unwrap();
        let tr = db
            .transition_terminal(&task.id, &TaskOutcome::Failed(json!({"e": 1})), at(2))
            .unwrap();
        let retry = tr.retry.unwrap();
        assert_eq!(
            db.get_schedule(&s.id).unwrap().last_scheduled_task_id,
            Some(retry.id.clone())
        );
        // Retry still outstanding: the next period is held back.
        assert!(db.materialize_due(&s.id, at(60_000)).unwrap().is_none());
    }

    #[test]
    fn test_failure_after_delete_does_not_retry() {
        let db = db();
        let mut new = NewSchedule::new("sync", "g", 60_000, json!({}));
        new.policy.retry_max = 3;
        let s = db.create_schedule(new, at(0)).unwrap();
        let task = db.materialize_due(&s.id, at(0)).unwrap().unwrap();
        db.dequeue(&[GroupKeyPattern::Exact("g".into())], 1, at(1)).unwrap();
        let delete = SchedulePatch {
            state: Some(ScheduleState::Deleted),
            ..Default::default()
        };
        db.update_schedule(&s.id, &delete, at(2)).unwrap();

        let tr = db
            .transition_terminal(&task.id, &TaskOutcome::Failed(json!({"e": 1})), at(3))
            .unwrap();
        assert_eq!(tr.task.state, TaskState::Failed);
        assert!(tr.retry.is_none());
        let pending = db
            .search_tasks(&TaskFilter {
                schedule_id: Some(s.id.clone()),
                state: Some(TaskState::Created),
                ..Default::default()
            })
            .unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_expiry_after_delete_does_not_retry() {
        let db = db();
        let mut new = NewSchedule::new("sync", "g", 60_000, json!({}));
        new.policy.retry_max = 3;
        new.policy.heartbeat_timeout_ms = 1_000;
        let s = db.create_schedule(new, at(0)).unwrap();
        db.materialize_due(&s.id, at(0)).unwrap().unwrap();
        db.dequeue(&[GroupKeyPattern::Exact("g".into())], 1, at(1)).unwrap();
        let delete = SchedulePatch {
            state: Some(ScheduleState::Deleted),
            ..Default::default()
        };
        db.update_schedule(&s.id, &delete, at(2)).unwrap();

        let swept = db.expire_stale(at(5_000)).unwrap();
        assert_eq!(swept.len(), 1);
        assert!(swept[0].retry.is_none());
    }

    #[test]
    fn test_due_schedules_skips_unreadable_rows() {
        let db = db();
        let broken = new_schedule(&db);
        let healthy = new_schedule(&db);
        db.lock()
            .unwrap()
            .execute(
                "UPDATE schedules SET payload_template = '{' WHERE id = ?1",
                [&broken.id],
            )
            .unwrap();
        let due = db.due_schedules(at(0)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, healthy.id);
    }

    #[test]
    fn test_search_schedules() {
        let db = db();
        let a = new_schedule(&db);
        db.create_schedule(NewSchedule::new("other", "x:y", 60_000, json!({})), at(1))
            .unwrap();
        let by_name = db
            .search_schedules(&ScheduleFilter {
                names: Some(vec!["sync-users".into()]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_name, vec![a.clone()]);
        let all = db.search_schedules(&ScheduleFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        let by_group = db
            .search_schedules(&ScheduleFilter {
                group_key: Some("x:y".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_group.len(), 1);

        let tasks = db
            .search_tasks(&TaskFilter {
                schedule_id: Some(a.id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert!(tasks.is_empty());
    }
}
