//! Request and response bodies of the orchestrator HTTP API.
//! Shared by the route handlers and the client SDK.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use syncflow_scheduler::{Schedule, ScheduleRequest, Task, TaskRequest, TaskState};

/// `POST /v1/immediate`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateRequest {
    #[serde(flatten)]
    pub task: TaskRequest,
    /// Block until the task finishes, for at most this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_output_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateResponse {
    pub task_id: String,
    /// False when an existing pending task with the same owner key was returned.
    pub created: bool,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// `POST /v1/recurring`
pub type RecurringRequest = ScheduleRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringResponse {
    pub schedule_id: String,
    pub schedule: Schedule,
}

/// `POST /v1/schedules/{scheduleId}/run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNowResponse {
    pub task_id: String,
    pub task: Task,
}

/// `POST /v1/dequeue`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueRequest {
    /// Exact group keys or `prefix*` patterns.
    pub group_keys: Vec<String>,
    #[serde(default = "default_dequeue_limit")]
    pub limit: usize,
    /// Long-poll: wait up to this long for work when nothing is eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

fn default_dequeue_limit() -> usize {
    1
}

impl DequeueRequest {
    pub fn new(group_keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            group_keys: group_keys.into_iter().map(Into::into).collect(),
            limit: default_dequeue_limit(),
            wait_ms: None,
        }
    }
}

/// `PUT /v1/tasks/{taskId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRequest {
    pub state: TaskState,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResponse {
    pub ok: bool,
    pub task: Task,
    /// The attempt enqueued because this outcome was retryable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_task_id: Option<String>,
}

/// `POST /v1/tasks/{taskId}/heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub task: Task,
}

/// `GET /v1/tasks/{taskId}/output`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResponse {
    pub task_id: String,
    /// Attempt that produced `state`; differs from `taskId` after retries.
    pub attempt_id: String,
    pub state: TaskState,
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl OutputResponse {
    pub fn new(task_id: &str, attempt: Task) -> Self {
        Self {
            task_id: task_id.to_string(),
            attempt_id: attempt.id,
            terminal: attempt.state.is_terminal(),
            state: attempt.state,
            output: attempt.output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleList {
    pub schedules: Vec<Schedule>,
}

/// Error body: `{"error": {"code": "...", "message": "..."}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}
