//! Recurring schedule definitions that materialize tasks on a cadence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_core::{OrchestratorError, Result};

use crate::tasks::{self, NewTask, TaskPolicy, MAX_DURATION_MS};

/// Shortest accepted interval between materializations.
pub const MIN_FREQUENCY_MS: u64 = 1_000;

/// Schedule lifecycle state. `DELETED` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleState {
    Started,
    Paused,
    Deleted,
}

impl ScheduleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::Started => "STARTED",
            ScheduleState::Paused => "PAUSED",
            ScheduleState::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleState {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STARTED" => Ok(ScheduleState::Started),
            "PAUSED" => Ok(ScheduleState::Paused),
            "DELETED" => Ok(ScheduleState::Deleted),
            other => Err(OrchestratorError::Validation(format!(
                "unknown schedule state '{other}'"
            ))),
        }
    }
}

/// A recurring definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub group_key: String,
    pub state: ScheduleState,
    pub frequency_ms: u64,
    pub payload_template: Value,
    /// Policy stamped on every materialized task.
    pub policy: TaskPolicy,
    pub last_scheduled_task_id: Option<String>,
    pub next_due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(new: NewSchedule, now: DateTime<Utc>) -> Self {
        Self {
            id: tasks::new_id(),
            name: new.name,
            group_key: new.group_key,
            state: ScheduleState::Started,
            frequency_ms: new.frequency_ms,
            payload_template: new.payload_template,
            policy: new.policy,
            last_scheduled_task_id: None,
            next_due_at: new.starts_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn frequency(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.frequency_ms.min(MAX_DURATION_MS) as i64)
    }

    /// Next due time after a materialization at `now`.
    ///
    /// Advances by one period from the previous due time, but never leaves the
    /// schedule in the past: missed periods are skipped, not replayed.
    pub fn next_due_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = self.next_due_at + self.frequency();
        if next <= now {
            now + self.frequency()
        } else {
            next
        }
    }

    /// The task materialized for one run of this schedule.
    pub fn materialize(&self) -> NewTask {
        NewTask {
            name: self.name.clone(),
            group_key: self.group_key.clone(),
            payload: self.payload_template.clone(),
            schedule_id: Some(self.id.clone()),
            owner_key: None,
            policy: self.policy,
            starts_after: None,
        }
    }

    /// Apply an edit. Returns true when the schedule moved to `DELETED`.
    pub fn apply(&mut self, patch: &SchedulePatch, now: DateTime<Utc>) -> Result<bool> {
        if self.state == ScheduleState::Deleted {
            if patch.is_delete_only() {
                return Ok(false);
            }
            return Err(OrchestratorError::InvalidTransition(format!(
                "schedule {} is deleted",
                self.id
            )));
        }
        if let Some(frequency_ms) = patch.frequency_ms {
            validate_frequency(frequency_ms)?;
            self.frequency_ms = frequency_ms;
            self.next_due_at = self.next_due_at.min(now + self.frequency());
        }
        if let Some(template) = &patch.payload_template {
            self.payload_template = template.clone();
        }
        if let Some(overrides) = &patch.policy {
            let policy = overrides.apply(self.policy);
            policy.validate()?;
            self.policy = policy;
        }
        let deleted = match patch.state {
            Some(ScheduleState::Deleted) => {
                self.state = ScheduleState::Deleted;
                true
            }
            Some(state) => {
                self.state = state;
                false
            }
            None => false,
        };
        self.updated_at = now;
        Ok(deleted)
    }
}

/// Parameters for creating a schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub name: String,
    pub group_key: String,
    pub frequency_ms: u64,
    pub payload_template: Value,
    pub policy: TaskPolicy,
    /// First due time; defaults to creation time.
    pub starts_at: Option<DateTime<Utc>>,
}

impl NewSchedule {
    pub fn new(
        name: impl Into<String>,
        group_key: impl Into<String>,
        frequency_ms: u64,
        payload_template: Value,
    ) -> Self {
        Self {
            name: name.into(),
            group_key: group_key.into(),
            frequency_ms,
            payload_template,
            policy: TaskPolicy::default(),
            starts_at: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::Validation("schedule name is required".into()));
        }
        tasks::validate_group_key(&self.group_key)?;
        validate_frequency(self.frequency_ms)?;
        self.materialize_probe().validate()
    }

    fn materialize_probe(&self) -> NewTask {
        NewTask::new(&self.name, &self.group_key, Value::Null).with_policy(self.policy)
    }
}

/// Partial update of a schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ScheduleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<tasks::PolicyOverrides>,
}

impl SchedulePatch {
    fn is_delete_only(&self) -> bool {
        self.state == Some(ScheduleState::Deleted)
            && self.frequency_ms.is_none()
            && self.payload_template.is_none()
            && self.policy.is_none()
    }
}

/// Read-only schedule query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ScheduleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn validate_frequency(frequency_ms: u64) -> Result<()> {
    if !(MIN_FREQUENCY_MS..=MAX_DURATION_MS).contains(&frequency_ms) {
        return Err(OrchestratorError::Validation(format!(
            "frequencyMs must be between {MIN_FREQUENCY_MS} and {MAX_DURATION_MS}"
        )));
    }
    Ok(())
}
