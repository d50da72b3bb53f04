//! Task definitions: the core data model for leased units of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_core::config::TaskDefaults;
use syncflow_core::{OrchestratorError, Result};

/// Task lifecycle state.
///
/// Transitions only move forward: `CREATED → STARTED → terminal`, plus
/// `CREATED → {EXPIRED, CANCELLED}` for tasks that never got leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Started,
    Succeeded,
    Failed,
    Expired,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Started => "STARTED",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Expired => "EXPIRED",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Created | TaskState::Started)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Created, TaskState::Started) => true,
            (TaskState::Created, TaskState::Expired | TaskState::Cancelled) => true,
            (TaskState::Started, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(TaskState::Created),
            "STARTED" => Ok(TaskState::Started),
            "SUCCEEDED" => Ok(TaskState::Succeeded),
            "FAILED" => Ok(TaskState::Failed),
            "EXPIRED" => Ok(TaskState::Expired),
            "CANCELLED" => Ok(TaskState::Cancelled),
            other => Err(OrchestratorError::Validation(format!(
                "unknown task state '{other}'"
            ))),
        }
    }
}

/// Retry budget and per-state timeouts, fixed on a task at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPolicy {
    pub retry_max: u32,
    pub created_to_started_timeout_ms: u64,
    pub started_to_completed_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl TaskPolicy {
    pub fn created_to_started_timeout(&self) -> chrono::Duration {
        millis(self.created_to_started_timeout_ms)
    }

    pub fn started_to_completed_timeout(&self) -> chrono::Duration {
        millis(self.started_to_completed_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        millis(self.heartbeat_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.created_to_started_timeout_ms == 0
            || self.started_to_completed_timeout_ms == 0
            || self.heartbeat_timeout_ms == 0
        {
            return Err(OrchestratorError::Validation(
                "task timeouts must be greater than zero".into(),
            ));
        }
        let longest = self
            .created_to_started_timeout_ms
            .max(self.started_to_completed_timeout_ms)
            .max(self.heartbeat_timeout_ms);
        if longest > MAX_DURATION_MS {
            return Err(OrchestratorError::Validation(format!(
                "task timeouts must not exceed {MAX_DURATION_MS}ms"
            )));
        }
        Ok(())
    }
}

impl From<&TaskDefaults> for TaskPolicy {
    fn from(d: &TaskDefaults) -> Self {
        Self {
            retry_max: d.retry_max,
            created_to_started_timeout_ms: d.created_to_started_timeout_ms,
            started_to_completed_timeout_ms: d.started_to_completed_timeout_ms,
            heartbeat_timeout_ms: d.heartbeat_timeout_ms,
        }
    }
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self::from(&TaskDefaults::default())
    }
}

/// Caller-supplied policy fields; anything left out falls back to the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_to_started_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_to_completed_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_ms: Option<u64>,
}

impl PolicyOverrides {
    pub fn apply(&self, base: TaskPolicy) -> TaskPolicy {
        TaskPolicy {
            retry_max: self.retry_max.unwrap_or(base.retry_max),
            created_to_started_timeout_ms: self
                .created_to_started_timeout_ms
                .unwrap_or(base.created_to_started_timeout_ms),
            started_to_completed_timeout_ms: self
                .started_to_completed_timeout_ms
                .unwrap_or(base.started_to_completed_timeout_ms),
            heartbeat_timeout_ms: self.heartbeat_timeout_ms.unwrap_or(base.heartbeat_timeout_ms),
        }
    }
}

/// A leased unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Script/action identifier the executor runs.
    pub name: String,
    /// Lease key; at most one STARTED task per group key.
    pub group_key: String,
    pub schedule_id: Option<String>,
    /// Id of the first attempt of this logical unit of work.
    pub retry_key: String,
    /// Client idempotency key.
    pub owner_key: Option<String>,
    /// Opaque to the orchestrator.
    pub payload: Value,
    pub state: TaskState,
    pub retry_count: u32,
    pub policy: TaskPolicy,
    pub created_at: DateTime<Utc>,
    pub starts_after: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
}

/// Why the sweep reclaimed a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    CreatedToStartedTimeout,
    StartedToCompletedTimeout,
    HeartbeatTimeout,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryReason::CreatedToStartedTimeout => "created_to_started_timeout",
            ExpiryReason::StartedToCompletedTimeout => "started_to_completed_timeout",
            ExpiryReason::HeartbeatTimeout => "heartbeat_timeout",
        }
    }
}

impl Task {
    /// Build the first attempt of a new unit of work.
    pub fn new(new: NewTask, now: DateTime<Utc>) -> Self {
        let id = new_id();
        Self {
            retry_key: id.clone(),
            id,
            name: new.name,
            group_key: new.group_key,
            schedule_id: new.schedule_id,
            owner_key: new.owner_key,
            payload: new.payload,
            state: TaskState::Created,
            retry_count: 0,
            policy: new.policy,
            created_at: now,
            starts_after: new.starts_after.unwrap_or(now),
            started_at: None,
            last_heartbeat_at: None,
            terminated_at: None,
            output: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.policy.retry_max
    }

    /// A fresh CREATED attempt carrying the same work, one retry further along.
    pub fn next_attempt(&self, now: DateTime<Utc>) -> Task {
        Task {
            id: new_id(),
            name: self.name.clone(),
            group_key: self.group_key.clone(),
            schedule_id: self.schedule_id.clone(),
            retry_key: self.retry_key.clone(),
            owner_key: self.owner_key.clone(),
            payload: self.payload.clone(),
            state: TaskState::Created,
            retry_count: self.retry_count + 1,
            policy: self.policy,
            created_at: now,
            starts_after: now,
            started_at: None,
            last_heartbeat_at: None,
            terminated_at: None,
            output: None,
        }
    }

    /// Returns the timeout this task has blown through at `now`, if any.
    pub fn stale_reason(&self, now: DateTime<Utc>) -> Option<ExpiryReason> {
        match self.state {
            TaskState::Created => {
                // A delayed task only starts waiting once it becomes eligible.
                let eligible_at = self.created_at.max(self.starts_after);
                (eligible_at + self.policy.created_to_started_timeout() < now)
                    .then_some(ExpiryReason::CreatedToStartedTimeout)
            }
            TaskState::Started => {
                let last_seen = self.last_heartbeat_at.or(self.started_at)?;
                if last_seen + self.policy.heartbeat_timeout() < now {
                    return Some(ExpiryReason::HeartbeatTimeout);
                }
                let started = self.started_at?;
                (started + self.policy.started_to_completed_timeout() < now)
                    .then_some(ExpiryReason::StartedToCompletedTimeout)
            }
            _ => None,
        }
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub name: String,
    pub group_key: String,
    pub payload: Value,
    pub schedule_id: Option<String>,
    pub owner_key: Option<String>,
    pub policy: TaskPolicy,
    pub starts_after: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, group_key: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            group_key: group_key.into(),
            payload,
            schedule_id: None,
            owner_key: None,
            policy: TaskPolicy::default(),
            starts_after: None,
        }
    }

    pub fn with_policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_owner_key(mut self, owner_key: impl Into<String>) -> Self {
        self.owner_key = Some(owner_key.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::Validation("task name is required".into()));
        }
        validate_group_key(&self.group_key)?;
        if self.owner_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(OrchestratorError::Validation("ownerKey must not be blank".into()));
        }
        self.policy.validate()
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(Value),
    Failed(Value),
    Expired(Value),
    Cancelled(Value),
}

impl TaskOutcome {
    /// Build an outcome from a reported state. Non-terminal states are rejected.
    pub fn from_state(state: TaskState, output: Value) -> Result<Self> {
        match state {
            TaskState::Succeeded => Ok(TaskOutcome::Succeeded(output)),
            TaskState::Failed => Ok(TaskOutcome::Failed(output)),
            TaskState::Expired => Ok(TaskOutcome::Expired(output)),
            TaskState::Cancelled => Ok(TaskOutcome::Cancelled(output)),
            other => Err(OrchestratorError::Validation(format!(
                "{other} is not a terminal state"
            ))),
        }
    }

    pub fn expired(reason: ExpiryReason) -> Self {
        TaskOutcome::Expired(serde_json::json!({
            "type": "expired",
            "reason": reason.as_str(),
        }))
    }

    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Succeeded(_) => TaskState::Succeeded,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Expired(_) => TaskState::Expired,
            TaskOutcome::Cancelled(_) => TaskState::Cancelled,
        }
    }

    pub fn output(&self) -> &Value {
        match self {
            TaskOutcome::Succeeded(v)
            | TaskOutcome::Failed(v)
            | TaskOutcome::Expired(v)
            | TaskOutcome::Cancelled(v) => v,
        }
    }

    /// Failures and expiries consume retry budget; success and cancellation do not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_) | TaskOutcome::Expired(_))
    }
}

/// Result of a terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub task: Task,
    /// The next attempt, when the outcome was retryable and budget remained.
    pub retry: Option<Task>,
    /// False when the call repeated an already-stored identical outcome.
    pub changed: bool,
}

/// Group key selector used by dequeue: exact key or `prefix*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKeyPattern {
    Exact(String),
    Prefix(String),
}

impl GroupKeyPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(OrchestratorError::Validation("group key must not be empty".into()));
        }
        match raw.strip_suffix('*') {
            Some(prefix) if !prefix.contains('*') => Ok(GroupKeyPattern::Prefix(prefix.into())),
            None if !raw.contains('*') => Ok(GroupKeyPattern::Exact(raw.into())),
            _ => Err(OrchestratorError::Validation(format!(
                "'*' is only allowed at the end of a group key pattern: {raw}"
            ))),
        }
    }

    pub fn parse_all(raw: &[String]) -> Result<Vec<Self>> {
        if raw.is_empty() {
            return Err(OrchestratorError::Validation("at least one group key is required".into()));
        }
        raw.iter().map(|k| Self::parse(k)).collect()
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            GroupKeyPattern::Exact(k) => k == key,
            GroupKeyPattern::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Read-only task query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Longest timeout or frequency accepted (one year).
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

pub const DEFAULT_SEARCH_LIMIT: usize = 100;
pub const MAX_SEARCH_LIMIT: usize = 1_000;

pub(crate) fn validate_group_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(OrchestratorError::Validation("groupKey is required".into()));
    }
    if key.contains('*') {
        return Err(OrchestratorError::Validation(format!(
            "groupKey must not contain '*': {key}"
        )));
    }
    Ok(())
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms.min(MAX_DURATION_MS) as i64)
}
