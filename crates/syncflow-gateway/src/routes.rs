//! API route handlers for the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use syncflow_core::OrchestratorError;
use syncflow_scheduler::{Schedule, ScheduleFilter, SchedulePatch, Task, TaskFilter};

use super::api::{
    DequeueRequest, ErrorBody, ErrorDetail, HeartbeatResponse, ImmediateRequest,
    ImmediateResponse, OutputQuery, OutputResponse, RecurringRequest, RecurringResponse,
    RunNowResponse, ScheduleList, TaskList, TerminalRequest, TerminalResponse,
};
use super::server::AppState;

// ─── Errors ───────────────────────────────────────────

/// An error rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub enum ApiError {
    Orchestrator(OrchestratorError),
    /// The request never reached the orchestrator (bad JSON, body too large, auth).
    Rejected {
        status: StatusCode,
        code: &'static str,
        message: String,
    },
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

impl ApiError {
    pub fn unauthorized() -> Self {
        ApiError::Rejected {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: "missing or invalid API key".into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Orchestrator(e) => status_for(e),
            ApiError::Rejected { status, .. } => *status,
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError::Orchestrator(e)
    }
}

/// HTTP status for each error kind.
pub fn status_for(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::InvalidTransition(_)
        | OrchestratorError::AlreadyTerminal(_)
        | OrchestratorError::DuplicateTask(_) => StatusCode::CONFLICT,
        OrchestratorError::LeaseLost(_) => StatusCode::GONE,
        OrchestratorError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Internal(_) | OrchestratorError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match self {
            ApiError::Orchestrator(e) => (e.code(), e.message().to_string()),
            ApiError::Rejected { code, message, .. } => (code, message),
        };
        if status.is_server_error() {
            tracing::error!("❌ {code}: {message}");
        } else {
            tracing::debug!("{status} {code}: {message}");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// `Json` extractor whose rejections use the API error body.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => {
                let status = rejection.status();
                let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
                    "payload_too_large"
                } else {
                    "validation_error"
                };
                Err(ApiError::Rejected {
                    status,
                    code,
                    message: rejection.body_text(),
                })
            }
        }
    }
}

fn capped_wait(state: &AppState, wait_ms: u64) -> Duration {
    Duration::from_millis(wait_ms.min(state.config.max_wait_ms))
}

// ─── Handlers ─────────────────────────────────────────

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "syncflow",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Enqueue a one-off task, optionally waiting for its outcome.
pub async fn create_immediate(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<ImmediateRequest>,
) -> ApiResult<ImmediateResponse> {
    let (task, created) = state.orchestrator.create_task(req.task)?;
    let task_id = task.id.clone();
    let current = match req.wait_for_output_ms {
        Some(ms) if ms > 0 && !task.is_terminal() => {
            state
                .orchestrator
                .wait_for_output(&task_id, capped_wait(&state, ms))
                .await?
        }
        _ => task,
    };
    Ok(Json(ImmediateResponse {
        task_id,
        created,
        state: current.state,
        output: current.output,
    }))
}

/// Define a recurring schedule.
pub async fn create_recurring(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<RecurringRequest>,
) -> ApiResult<RecurringResponse> {
    let schedule = state.orchestrator.create_schedule(req)?;
    Ok(Json(RecurringResponse {
        schedule_id: schedule.id.clone(),
        schedule,
    }))
}

/// Pause, resume, delete or edit a schedule.
pub async fn update_recurring(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
    ApiJson(patch): ApiJson<SchedulePatch>,
) -> ApiResult<Schedule> {
    Ok(Json(state.orchestrator.update_schedule(&schedule_id, &patch)?))
}

/// Materialize a schedule now.
pub async fn run_schedule_now(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
) -> ApiResult<RunNowResponse> {
    let task = state.orchestrator.run_schedule_now(&schedule_id)?;
    Ok(Json(RunNowResponse {
        task_id: task.id.clone(),
        task,
    }))
}

pub async fn search_tasks(
    State(state): State<Arc<AppState>>,
    ApiJson(filter): ApiJson<TaskFilter>,
) -> ApiResult<TaskList> {
    let tasks = state.orchestrator.search_tasks(&filter).await?;
    Ok(Json(TaskList { tasks }))
}

pub async fn search_schedules(
    State(state): State<Arc<AppState>>,
    ApiJson(filter): ApiJson<ScheduleFilter>,
) -> ApiResult<ScheduleList> {
    let schedules = state.orchestrator.search_schedules(&filter).await?;
    Ok(Json(ScheduleList { schedules }))
}

/// Lease tasks for a worker.
pub async fn dequeue(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<DequeueRequest>,
) -> ApiResult<TaskList> {
    let wait = capped_wait(&state, req.wait_ms.unwrap_or(0));
    let tasks = state
        .orchestrator
        .dequeue(&req.group_keys, req.limit, wait)
        .await?;
    Ok(Json(TaskList { tasks }))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Task> {
    Ok(Json(state.orchestrator.get_task(&task_id)?))
}

/// Report a terminal outcome.
pub async fn set_terminal_state(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    ApiJson(req): ApiJson<TerminalRequest>,
) -> ApiResult<TerminalResponse> {
    let t = state
        .orchestrator
        .complete(&task_id, req.state, req.output)?;
    Ok(Json(TerminalResponse {
        ok: true,
        retry_task_id: t.retry.map(|r| r.id),
        task: t.task,
    }))
}

/// Current state and output; with `waitMs`, waits for the outcome first.
/// A task still running after the wait is a normal response.
pub async fn get_output(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<OutputResponse> {
    let wait = capped_wait(&state, query.wait_ms.unwrap_or(0));
    let attempt = state.orchestrator.wait_for_output(&task_id, wait).await?;
    Ok(Json(OutputResponse::new(&task_id, attempt)))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<HeartbeatResponse> {
    let task = state.orchestrator.heartbeat(&task_id)?;
    Ok(Json(HeartbeatResponse { ok: true, task }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncflow_core::config::ServerConfig;
    use syncflow_scheduler::{
        ManualClock, Orchestrator, SchedulerDb, ScheduleRequest, ScheduleState, TaskRequest,
        TaskState,
    };

    fn test_state() -> State<Arc<AppState>> {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let orchestrator = Orchestrator::new(db, Arc::new(ManualClock::at_epoch()));
        State(Arc::new(AppState::new(
            Arc::new(orchestrator),
            ServerConfig::default(),
        )))
    }

    fn immediate(group_key: &str) -> ImmediateRequest {
        ImmediateRequest {
            task: TaskRequest {
                name: "sync-users".into(),
                group_key: group_key.into(),
                payload: json!({"full": true}),
                ..Default::default()
            },
            wait_for_output_ms: None,
        }
    }

    async fn lease(state: &State<Arc<AppState>>, group_key: &str) -> Task {
        let Json(list) = dequeue(
            State(state.0.clone()),
            ApiJson(DequeueRequest::new([group_key])),
        )
        .await
        .unwrap();
        list.tasks.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let Json(json) = health_check(test_state()).await;
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn test_immediate_then_dequeue_and_complete() {
        let state = test_state();
        let Json(created) = create_immediate(State(state.0.clone()), ApiJson(immediate("acme:github")))
            .await
            .unwrap();
        assert!(created.created);
        assert_eq!(created.state, TaskState::Created);

        let leased = lease(&state, "acme:*").await;
        assert_eq!(leased.id, created.task_id);

        let Json(hb) = heartbeat(State(state.0.clone()), Path(leased.id.clone()))
            .await
            .unwrap();
        assert!(hb.ok);

        let Json(done) = set_terminal_state(
            State(state.0.clone()),
            Path(leased.id.clone()),
            ApiJson(TerminalRequest {
                state: TaskState::Succeeded,
                output: json!({"added": 3}),
            }),
        )
        .await
        .unwrap();
        assert_eq!(done.task.state, TaskState::Succeeded);
        assert!(done.retry_task_id.is_none());

        let Json(out) = get_output(
            State(state.0.clone()),
            Path(leased.id.clone()),
            Query(OutputQuery::default()),
        )
        .await
        .unwrap();
        assert!(out.terminal);
        assert_eq!(out.output, Some(json!({"added": 3})));
    }

    #[tokio::test]
    async fn test_output_of_running_task_is_not_an_error() {
        let state = test_state();
        let Json(created) = create_immediate(State(state.0.clone()), ApiJson(immediate("g")))
            .await
            .unwrap();
        let Json(out) = get_output(
            State(state.0.clone()),
            Path(created.task_id.clone()),
            Query(OutputQuery { wait_ms: Some(10) }),
        )
        .await
        .unwrap();
        assert!(!out.terminal);
        assert_eq!(out.state, TaskState::Created);
        assert!(out.output.is_none());
    }

    #[tokio::test]
    async fn test_immediate_waits_for_output() {
        let state = test_state();
        let worker_state = state.0.clone();
        let worker = tokio::spawn(async move {
            loop {
                let tasks = worker_state
                    .orchestrator
                    .dequeue(&["g".to_string()], 1, Duration::from_secs(1))
                    .await
                    .unwrap();
                if let Some(task) = tasks.into_iter().next() {
                    worker_state
                        .orchestrator
                        .complete(&task.id, TaskState::Succeeded, json!({"added": 3}))
                        .unwrap();
                    return;
                }
            }
        });
        let mut req = immediate("g");
        req.wait_for_output_ms = Some(5_000);
        let Json(resp) = create_immediate(State(state.0.clone()), ApiJson(req))
            .await
            .unwrap();
        assert_eq!(resp.state, TaskState::Succeeded);
        assert_eq!(resp.output, Some(json!({"added": 3})));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_recurring_lifecycle() {
        let state = test_state();
        let Json(created) = create_recurring(
            State(state.0.clone()),
            ApiJson(ScheduleRequest {
                name: "sync-users".into(),
                group_key: "acme:github:sync-users".into(),
                frequency_ms: 60_000,
                payload_template: json!({"sync": "users"}),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let Json(run) = run_schedule_now(State(state.0.clone()), Path(created.schedule_id.clone()))
            .await
            .unwrap();
        assert_eq!(run.task.schedule_id.as_deref(), Some(created.schedule_id.as_str()));

        let err = run_schedule_now(State(state.0.clone()), Path(created.schedule_id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let Json(paused) = update_recurring(
            State(state.0.clone()),
            Path(created.schedule_id.clone()),
            ApiJson(SchedulePatch {
                state: Some(ScheduleState::Paused),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(paused.state, ScheduleState::Paused);

        let Json(found) = search_schedules(
            State(state.0.clone()),
            ApiJson(ScheduleFilter {
                state: Some(ScheduleState::Paused),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(found.schedules.len(), 1);

        let Json(tasks) = search_tasks(
            State(state.0.clone()),
            ApiJson(TaskFilter {
                schedule_id: Some(created.schedule_id.clone()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(tasks.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let state = test_state();
        let missing = get_task(State(state.0.clone()), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let Json(created) = create_immediate(State(state.0.clone()), ApiJson(immediate("g")))
            .await
            .unwrap();
        // Heartbeat before lease.
        let err = heartbeat(State(state.0.clone()), Path(created.task_id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        // Cancelled by an operator, then the worker shows up.
        set_terminal_state(
            State(state.0.clone()),
            Path(created.task_id.clone()),
            ApiJson(TerminalRequest {
                state: TaskState::Cancelled,
                output: json!(null),
            }),
        )
        .await
        .unwrap();
        let err = heartbeat(State(state.0.clone()), Path(created.task_id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::GONE);

        let bad = dequeue(State(state.0.clone()), ApiJson(DequeueRequest::new(Vec::<String>::new())))
            .await
            .unwrap_err();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_owner_key_returns_original() {
        let state = test_state();
        let mut req = immediate("g");
        req.task.owner_key = Some("webhook-42".into());
        let Json(first) = create_immediate(State(state.0.clone()), ApiJson(req.clone()))
            .await
            .unwrap();
        let Json(second) = create_immediate(State(state.0.clone()), ApiJson(req))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.task_id, first.task_id);
    }

    #[test]
    fn test_status_mapping() {
        use OrchestratorError::*;
        let cases = [
            (NotFound(String::new()), 404),
            (Validation(String::new()), 400),
            (InvalidTransition(String::new()), 409),
            (AlreadyTerminal(String::new()), 409),
            (DuplicateTask(String::new()), 409),
            (LeaseLost(String::new()), 410),
            (StoreUnavailable(String::new()), 503),
            (Internal(String::new()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err).as_u16(), status, "{err}");
        }
    }
}
