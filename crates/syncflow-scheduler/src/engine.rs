//! Orchestrator engine: the API-facing facade over the store, plus the
//! scheduler loop (materialization pass and sweep pass).
//!
//! The store is the only shared state. The engine adds the clock, default
//! policies, read retries and event publication so that output waiters and
//! long-polling workers wake up without polling.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_core::{OrchestratorConfig, OrchestratorError, Result};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::notify::{EventBus, TaskEvent};
use crate::persistence::SchedulerDb;
use crate::schedules::{NewSchedule, Schedule, ScheduleFilter, SchedulePatch};
use crate::tasks::{
    GroupKeyPattern, NewTask, PolicyOverrides, Task, TaskFilter, TaskOutcome, TaskPolicy,
    TaskState, Transition,
};

/// Largest batch a single dequeue call may lease.
pub const MAX_DEQUEUE_LIMIT: usize = 100;

/// How often a long-polling dequeue re-checks the store without an event,
/// so delayed (`startsAfter`) tasks are picked up.
const LONG_POLL_RECHECK: Duration = Duration::from_secs(1);

/// Request to enqueue a one-off task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub name: String,
    pub group_key: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_after: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyOverrides>,
}

/// Request to define a recurring schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub name: String,
    pub group_key: String,
    pub frequency_ms: u64,
    #[serde(default)]
    pub payload_template: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyOverrides>,
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Tasks materialized from due schedules.
    pub materialized: Vec<String>,
    /// Tasks the sweep moved to EXPIRED.
    pub expired: Vec<String>,
    /// Retry attempts created by the sweep.
    pub retried: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.materialized.is_empty() && self.expired.is_empty() && self.retried.is_empty()
    }
}

/// The task orchestrator.
pub struct Orchestrator {
    db: Arc<SchedulerDb>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    defaults: TaskPolicy,
    read_retries: u32,
    read_backoff: Duration,
}

impl Orchestrator {
    pub fn new(db: Arc<SchedulerDb>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            events: EventBus::default(),
            defaults: TaskPolicy::default(),
            read_retries: 3,
            read_backoff: Duration::from_millis(50),
        }
    }

    /// Open the configured store and build an orchestrator on the system clock.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let db = if config.store.path == ":memory:" {
            SchedulerDb::open_in_memory()?
        } else {
            let path = config.store.resolved_path();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            open_store(&path, Duration::from_millis(config.store.busy_timeout_ms))?
        };
        Ok(Self::new(Arc::new(db), Arc::new(SystemClock::new()))
            .with_defaults(TaskPolicy::from(&config.defaults))
            .with_read_retry(
                config.store.read_retries,
                Duration::from_millis(config.store.read_retry_backoff_ms),
            ))
    }

    pub fn with_defaults(mut self, defaults: TaskPolicy) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_read_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.read_retries = retries;
        self.read_backoff = backoff;
        self
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.db
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    // ─── Tasks ────────────────────────────────────────

    /// Enqueue a one-off task.
    ///
    /// When the owner key is held by a pending task, that task is returned
    /// instead and the flag is false.
    pub fn create_task(&self, req: TaskRequest) -> Result<(Task, bool)> {
        let new = NewTask {
            name: req.name,
            group_key: req.group_key,
            payload: req.payload,
            schedule_id: None,
            owner_key: req.owner_key,
            policy: req.policy.unwrap_or_default().apply(self.defaults),
            starts_after: req.starts_after,
        };
        match self.db.create_task(new, self.clock.now()) {
            Ok(task) => {
                tracing::info!("📥 Task created: '{}' {} [{}]", task.name, task.id, task.group_key);
                self.events.publish(TaskEvent::created(&task));
                Ok((task, true))
            }
            Err(OrchestratorError::DuplicateTask(existing)) => {
                tracing::debug!("Owner key already pending on task {existing}");
                Ok((self.db.get_task(&existing)?, false))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.db.get_task(task_id)
    }

    /// Lease eligible tasks for the given group keys (`prefix*` allowed).
    ///
    /// With a non-zero `wait`, blocks until something is leased or the wait
    /// runs out. Wake-ups come from task events; the store decides.
    pub async fn dequeue(
        &self,
        group_keys: &[String],
        limit: usize,
        wait: Duration,
    ) -> Result<Vec<Task>> {
        let patterns = GroupKeyPattern::parse_all(group_keys)?;
        if limit == 0 || limit > MAX_DEQUEUE_LIMIT {
            return Err(OrchestratorError::Validation(format!(
                "limit must be between 1 and {MAX_DEQUEUE_LIMIT}"
            )));
        }
        let mut rx = self.events.subscribe();
        let deadline = Instant::now() + wait;
        loop {
            let leased = self
                .read_with_retry("dequeue", || {
                    self.db.dequeue(&patterns, limit, self.clock.now())
                })
                .await?;
            if !leased.is_empty() {
                for task in &leased {
                    tracing::info!("🔒 Task leased: {} [{}]", task.id, task.group_key);
                }
                return Ok(leased);
            }
            if Instant::now() >= deadline {
                return Ok(leased);
            }
            let recheck_at = deadline.min(Instant::now() + LONG_POLL_RECHECK);
            let woke = wait_for_event(&mut rx, recheck_at, |e| {
                patterns.iter().any(|p| p.matches(e.group_key()))
            })
            .await;
            if woke == Wake::Closed {
                return Ok(Vec::new());
            }
        }
    }

    pub fn heartbeat(&self, task_id: &str) -> Result<Task> {
        self.db.heartbeat(task_id, self.clock.now())
    }

    /// Record a terminal outcome reported by a worker or an operator.
    ///
    /// EXPIRED is reserved for the sweep.
    pub fn complete(&self, task_id: &str, state: TaskState, output: Value) -> Result<Transition> {
        if state == TaskState::Expired {
            return Err(OrchestratorError::Validation(
                "EXPIRED is set by the scheduler sweep only".into(),
            ));
        }
        let outcome = TaskOutcome::from_state(state, output)?;
        let transition = self
            .db
            .transition_terminal(task_id, &outcome, self.clock.now())?;
        if transition.changed {
            tracing::info!("✅ Task {} → {}", task_id, transition.task.state);
            self.publish_transition(&transition);
        }
        Ok(transition)
    }

    /// Wait for the logical unit of work started by `task_id` to finish.
    ///
    /// Follows retries: the result is the latest attempt. When the timeout
    /// passes first, the latest attempt is returned in its current,
    /// non-terminal state.
    pub async fn wait_for_output(&self, task_id: &str, timeout: Duration) -> Result<Task> {
        // Subscribe before the first read so a completion in between is not missed.
        let mut rx = self.events.subscribe();
        let deadline = Instant::now() + timeout;
        let task = self.db.get_task(task_id)?;
        let retry_key = task.retry_key;
        let group_key = task.group_key;
        loop {
            let current = self.db.latest_attempt(&retry_key)?;
            if current.is_terminal() {
                return Ok(current);
            }
            let woke = wait_for_event(&mut rx, deadline, |e| {
                matches!(e, TaskEvent::Terminated { .. }) && e.group_key() == group_key
            })
            .await;
            if matches!(woke, Wake::TimedOut | Wake::Closed) {
                break;
            }
        }
        // Final authoritative read covers a dropped notification.
        self.db.latest_attempt(&retry_key)
    }

    pub async fn search_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.read_with_retry("search tasks", || self.db.search_tasks(filter))
            .await
    }

    // ─── Schedules ────────────────────────────────────

    pub fn create_schedule(&self, req: ScheduleRequest) -> Result<Schedule> {
        let new = NewSchedule {
            name: req.name,
            group_key: req.group_key,
            frequency_ms: req.frequency_ms,
            payload_template: req.payload_template,
            policy: req.policy.unwrap_or_default().apply(self.defaults),
            starts_at: req.starts_at,
        };
        let schedule = self.db.create_schedule(new, self.clock.now())?;
        tracing::info!(
            "📅 Schedule created: '{}' {} every {}ms",
            schedule.name,
            schedule.id,
            schedule.frequency_ms
        );
        Ok(schedule)
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Result<Schedule> {
        self.db.get_schedule(schedule_id)
    }

    pub fn update_schedule(&self, schedule_id: &str, patch: &SchedulePatch) -> Result<Schedule> {
        let (schedule, cancelled) = self
            .db
            .update_schedule(schedule_id, patch, self.clock.now())?;
        tracing::info!("📝 Schedule {} updated ({})", schedule.id, schedule.state);
        for task in &cancelled {
            tracing::info!("🚫 Task {} cancelled with its schedule", task.id);
            self.events.publish(TaskEvent::terminated(task));
        }
        Ok(schedule)
    }

    /// Materialize a schedule right away and restart its cadence.
    pub fn run_schedule_now(&self, schedule_id: &str) -> Result<Task> {
        let task = self.db.trigger_now(schedule_id, self.clock.now())?;
        tracing::info!("▶️ Schedule {} run now: task {}", schedule_id, task.id);
        self.events.publish(TaskEvent::created(&task));
        Ok(task)
    }

    pub async fn search_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        self.read_with_retry("search schedules", || self.db.search_schedules(filter))
            .await
    }

    // ─── Scheduler loop ───────────────────────────────

    /// One scheduler iteration: materialize due schedules, then sweep stale
    /// tasks. Per-item failures are logged and skipped.
    pub fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        match self.db.due_schedules(now) {
            Ok(due) => {
                for schedule in due {
                    match self.db.materialize_due(&schedule.id, now) {
                        Ok(Some(task)) => {
                            tracing::info!(
                                "🔔 Schedule '{}' materialized task {}",
                                schedule.name,
                                task.id
                            );
                            self.events.publish(TaskEvent::created(&task));
                            report.materialized.push(task.id);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("⚠️ Failed to materialize schedule {}: {e}", schedule.id)
                        }
                    }
                }
            }
            Err(e) => tracing::error!("❌ Materialization pass failed: {e}"),
        }

        match self.db.expire_stale(now) {
            Ok(transitions) => {
                for t in transitions {
                    self.publish_transition(&t);
                    report.expired.push(t.task.id);
                    if let Some(retry) = t.retry {
                        report.retried.push(retry.id);
                    }
                }
            }
            Err(e) => tracing::error!("❌ Sweep pass failed: {e}"),
        }

        if !report.is_empty() {
            tracing::debug!(
                "Tick: {} materialized, {} expired, {} retried",
                report.materialized.len(),
                report.expired.len(),
                report.retried.len()
            );
        }
        report
    }

    fn publish_transition(&self, t: &Transition) {
        self.events.publish(TaskEvent::terminated(&t.task));
        if let Some(retry) = &t.retry {
            tracing::info!(
                "🔁 Task {} retried as {} (attempt {})",
                t.task.id,
                retry.id,
                retry.retry_count + 1
            );
            self.events.publish(TaskEvent::created(retry));
        }
    }

    /// Run a read path, retrying `StoreUnavailable` with exponential backoff
    /// and jitter.
    async fn read_with_retry<T>(&self, op: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match f() {
                Err(e) if e.is_retryable() && attempt < self.read_retries => {
                    let base = self.read_backoff.saturating_mul(1 << attempt.min(10));
                    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
                    let delay = base + Duration::from_millis(jitter_ms);
                    tracing::warn!("⚠️ {op} failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn open_store(path: &Path, busy_timeout: Duration) -> Result<SchedulerDb> {
    let db = SchedulerDb::open(path, busy_timeout)?;
    tracing::info!("🗄️ Task store opened at {}", path.display());
    Ok(db)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Event,
    TimedOut,
    Closed,
}

/// Wait until an event matching `relevant` arrives, the channel lags (the
/// caller must re-read the store), or `until` passes.
async fn wait_for_event(
    rx: &mut broadcast::Receiver<TaskEvent>,
    until: Instant,
    relevant: impl Fn(&TaskEvent) -> bool,
) -> Wake {
    loop {
        match tokio::time::timeout_at(until, rx.recv()).await {
            Err(_) => return Wake::TimedOut,
            Ok(Ok(event)) if relevant(&event) => return Wake::Event,
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => return Wake::Event,
            Ok(Err(broadcast::error::RecvError::Closed)) => return Wake::Closed,
        }
    }
}

/// Spawn the scheduler loop as a background tokio task.
///
/// Ticks every `interval` until `shutdown` flips to true.
pub fn spawn_scheduler(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Scheduler started (tick every {}ms)", interval.as_millis());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    orchestrator.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("⏰ Scheduler stopped");
    })
}
