//! Typed HTTP client for the orchestrator API, used by workers and
//! service-to-service callers.
//!
//! API errors come back as [`OrchestratorError`] rebuilt from the wire code,
//! so a worker can stop on `LeaseLost` and retry on `StoreUnavailable`.

use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use syncflow_core::OrchestratorError;
use syncflow_scheduler::{Schedule, ScheduleFilter, SchedulePatch, Task, TaskFilter, TaskState};

use super::api::{
    DequeueRequest, ErrorBody, HeartbeatResponse, ImmediateRequest, ImmediateResponse,
    OutputResponse, RecurringRequest, RecurringResponse, RunNowResponse, ScheduleList, TaskList,
    TerminalRequest, TerminalResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] OrchestratorError),
    /// Missing or wrong API key; a configuration problem on the caller's side.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// Whether resending the same request is safe and may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Api(e) => e.is_retryable(),
            ClientError::Http(e) => e.is_connect() || e.is_timeout(),
            ClientError::Unauthorized(_) => false,
        }
    }

    /// True when the orchestrator has reclaimed the task; the worker should stop.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, ClientError::Api(OrchestratorError::LeaseLost(_)))
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Orchestrator API client.
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub async fn health(&self) -> ClientResult<serde_json::Value> {
        self.send(self.request(Method::GET, "/health")).await
    }

    pub async fn create_immediate(&self, req: &ImmediateRequest) -> ClientResult<ImmediateResponse> {
        self.post("/v1/immediate", req).await
    }

    pub async fn create_recurring(&self, req: &RecurringRequest) -> ClientResult<RecurringResponse> {
        self.post("/v1/recurring", req).await
    }

    pub async fn update_recurring(
        &self,
        schedule_id: &str,
        patch: &SchedulePatch,
    ) -> ClientResult<Schedule> {
        let path = format!("/v1/recurring/{schedule_id}");
        self.send(self.request(Method::PUT, &path).json(patch)).await
    }

    pub async fn run_schedule_now(&self, schedule_id: &str) -> ClientResult<RunNowResponse> {
        let path = format!("/v1/schedules/{schedule_id}/run");
        self.send(self.request(Method::POST, &path)).await
    }

    pub async fn search_tasks(&self, filter: &TaskFilter) -> ClientResult<Vec<Task>> {
        let list: TaskList = self.post("/v1/tasks/search", filter).await?;
        Ok(list.tasks)
    }

    pub async fn search_schedules(&self, filter: &ScheduleFilter) -> ClientResult<Vec<Schedule>> {
        let list: ScheduleList = self.post("/v1/schedules/search", filter).await?;
        Ok(list.schedules)
    }

    pub async fn dequeue(&self, req: &DequeueRequest) -> ClientResult<Vec<Task>> {
        let list: TaskList = self.post("/v1/dequeue", req).await?;
        Ok(list.tasks)
    }

    pub async fn get_task(&self, task_id: &str) -> ClientResult<Task> {
        let path = format!("/v1/tasks/{task_id}");
        self.send(self.request(Method::GET, &path)).await
    }

    pub async fn heartbeat(&self, task_id: &str) -> ClientResult<HeartbeatResponse> {
        let path = format!("/v1/tasks/{task_id}/heartbeat");
        self.send(self.request(Method::POST, &path)).await
    }

    pub async fn set_terminal_state(
        &self,
        task_id: &str,
        state: TaskState,
        output: serde_json::Value,
    ) -> ClientResult<TerminalResponse> {
        let path = format!("/v1/tasks/{task_id}");
        let body = TerminalRequest { state, output };
        self.send(self.request(Method::PUT, &path).json(&body)).await
    }

    pub async fn get_output(&self, task_id: &str, wait_ms: Option<u64>) -> ClientResult<OutputResponse> {
        let path = format!("/v1/tasks/{task_id}/output");
        let mut req = self.request(Method::GET, &path);
        if let Some(ms) = wait_ms {
            req = req.query(&[("waitMs", ms)]);
        }
        self.send(req).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> ClientResult<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&text).ok();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let message = body.map(|b| b.error.message).unwrap_or(text);
            tracing::warn!("🔐 Orchestrator API rejected the API key: {message}");
            return Err(ClientError::Unauthorized(message));
        }
        let err = match body {
            Some(body) => OrchestratorError::from_code(&body.error.code, body.error.message),
            None => OrchestratorError::from_code(
                if status.as_u16() == 503 { "store_unavailable" } else { "internal_error" },
                format!("HTTP {status}: {text}"),
            ),
        };
        tracing::debug!("Orchestrator API returned {status}: {err}");
        Err(ClientError::Api(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AppState, serve};
    use serde_json::json;
    use std::sync::Arc;
    use syncflow_core::config::ServerConfig;
    use syncflow_scheduler::{ManualClock, Orchestrator, SchedulerDb, TaskRequest};

    /// Bind an ephemeral port and serve a fresh in-memory orchestrator.
    async fn spawn_server(api_key: Option<&str>) -> (String, tokio::sync::oneshot::Sender<()>) {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let orchestrator = Arc::new(Orchestrator::new(db, Arc::new(ManualClock::at_epoch())));
        let config = ServerConfig {
            api_key: api_key.map(String::from),
            request_log: false,
            ..Default::default()
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, AppState::new(orchestrator, config), async {
            rx.await.ok();
        }));
        (format!("http://{addr}"), tx)
    }

    #[tokio::test]
    async fn test_worker_flow_end_to_end() {
        let (url, stop) = spawn_server(Some("k")).await;
        let client = OrchestratorClient::new(&url).with_api_key("k");
        assert_eq!(client.health().await.unwrap()["status"], "ok");

        let created = client
            .create_immediate(&ImmediateRequest {
                task: TaskRequest {
                    name: "sync-users".into(),
                    group_key: "acme:github:sync-users".into(),
                    payload: json!({"full": true}),
                    ..Default::default()
                },
                wait_for_output_ms: None,
            })
            .await
            .unwrap();
        assert!(created.created);

        let leased = client.dequeue(&DequeueRequest::new(["acme:*"])).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].payload, json!({"full": true}));

        client.heartbeat(&created.task_id).await.unwrap();
        let done = client
            .set_terminal_state(&created.task_id, TaskState::Succeeded, json!({"added": 3}))
            .await
            .unwrap();
        assert!(done.ok);
        // Retried report after a lost response is accepted.
        client
            .set_terminal_state(&created.task_id, TaskState::Succeeded, json!({"added": 3}))
            .await
            .unwrap();

        let out = client.get_output(&created.task_id, Some(10)).await.unwrap();
        assert!(out.terminal);
        assert_eq!(out.output, Some(json!({"added": 3})));

        let err = client.heartbeat(&created.task_id).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, ClientError::Api(OrchestratorError::InvalidTransition(_))));

        let found = client
            .search_tasks(&TaskFilter {
                state: Some(TaskState::Succeeded),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        stop.send(()).ok();
    }

    #[tokio::test]
    async fn test_errors_are_rebuilt_from_codes() {
        let (url, stop) = spawn_server(Some("k")).await;

        let anonymous = OrchestratorClient::new(&url);
        let err = anonymous.get_task("x").await.unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized(_)));
        assert!(!err.is_retryable());
        let wrong_key = OrchestratorClient::new(&url).with_api_key("nope");
        let err = wrong_key.heartbeat("x").await.unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized(_)));

        let client = OrchestratorClient::new(format!("{url}/")).with_api_key("k");
        let err = client.get_task("missing").await.unwrap_err();
        assert!(matches!(err, ClientError::Api(OrchestratorError::NotFound(_))));
        let err = client.run_schedule_now("missing").await.unwrap_err();
        assert!(matches!(err, ClientError::Api(OrchestratorError::NotFound(_))));
        stop.send(()).ok();
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = OrchestratorClient::new(format!("http://{addr}"));
        let err = client.get_task("x").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
