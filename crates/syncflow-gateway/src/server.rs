//! HTTP server implementation using Axum.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::response::IntoResponse;
use axum::{
    Router,
    routing::{get, post, put},
};
use syncflow_core::config::ServerConfig;
use syncflow_scheduler::Orchestrator;
use tower_http::trace::TraceLayer;

use super::routes::{self, ApiError};

/// Shared state for the API server.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: ServerConfig,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, config: ServerConfig) -> Self {
        Self {
            orchestrator,
            config,
            start_time: std::time::Instant::now(),
        }
    }
}

/// API key middleware: validates `Authorization: Bearer <key>`.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    // No key configured: open API.
    let Some(expected) = &state.config.api_key else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(expected.as_str()) {
        return next.run(req).await;
    }

    tracing::warn!("🔐 Rejected {} {}: bad API key", req.method(), req.uri().path());
    ApiError::unauthorized().into_response()
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    // Protected routes: require the API key when one is configured.
    let protected = Router::new()
        .route("/v1/immediate", post(routes::create_immediate))
        .route("/v1/recurring", post(routes::create_recurring))
        .route("/v1/recurring/{schedule_id}", put(routes::update_recurring))
        .route(
            "/v1/schedules/{schedule_id}/run",
            post(routes::run_schedule_now),
        )
        .route("/v1/tasks/search", post(routes::search_tasks))
        .route("/v1/schedules/search", post(routes::search_schedules))
        // Worker protocol
        .route("/v1/dequeue", post(routes::dequeue))
        .route(
            "/v1/tasks/{task_id}",
            get(routes::get_task).put(routes::set_terminal_state),
        )
        .route("/v1/tasks/{task_id}/output", get(routes::get_output))
        .route("/v1/tasks/{task_id}/heartbeat", post(routes::heartbeat))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_api_key,
        ));

    // Public routes: no auth
    let public = Router::new().route("/health", get(routes::health_check));

    let router = protected
        .merge(public)
        .layer(DefaultBodyLimit::max(shared.config.max_body_bytes));
    let router = if shared.config.request_log {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    };
    router.with_state(shared)
}

/// Serve the API on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Start the HTTP server on the configured address.
pub async fn start(
    orchestrator: Arc<Orchestrator>,
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Orchestrator API listening on http://{}", addr);
    if config.api_key.is_none() {
        tracing::warn!("⚠️ No API key configured; /v1 routes are open");
    }
    serve(listener, AppState::new(orchestrator, config), shutdown).await?;
    tracing::info!("🌐 Orchestrator API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use syncflow_scheduler::{ManualClock, SchedulerDb};
    use tower::ServiceExt;

    fn app(config: ServerConfig) -> Router {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let orchestrator = Orchestrator::new(db, Arc::new(ManualClock::at_epoch()));
        build_router(AppState::new(Arc::new(orchestrator), config))
    }

    fn keyed() -> ServerConfig {
        ServerConfig {
            api_key: Some("s3cret".into()),
            ..Default::default()
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let resp = app(keyed())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_required() {
        let router = app(keyed());
        let resp = router
            .clone()
            .oneshot(post_json("/v1/tasks/search", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"]["code"], "unauthorized");

        let mut req = post_json("/v1/tasks/search", "{}");
        req.headers_mut()
            .insert("authorization", "Bearer s3cret".parse().unwrap());
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["tasks"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_validation_error() {
        let resp = app(ServerConfig::default())
            .oneshot(post_json("/v1/immediate", "{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn test_body_limit() {
        let config = ServerConfig {
            max_body_bytes: 64,
            ..Default::default()
        };
        let big = format!(
            r#"{{"name":"s","groupKey":"g","payload":"{}"}}"#,
            "x".repeat(256)
        );
        let resp = app(config)
            .oneshot(post_json("/v1/immediate", &big))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_unknown_task_is_404_with_error_body() {
        let resp = app(ServerConfig::default())
            .oneshot(Request::get("/v1/tasks/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "not_found");
        assert!(json["error"]["message"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_immediate_roundtrip_over_router() {
        let router = app(ServerConfig::default());
        let resp = router
            .clone()
            .oneshot(post_json(
                "/v1/immediate",
                r#"{"name":"sync-users","groupKey":"acme:github:sync-users","payload":{}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        assert_eq!(created["state"], "CREATED");
        let task_id = created["taskId"].as_str().unwrap().to_string();

        let resp = router
            .clone()
            .oneshot(post_json("/v1/dequeue", r#"{"groupKeys":["acme:*"],"limit":5}"#))
            .await
            .unwrap();
        let leased = body_json(resp).await;
        assert_eq!(leased["tasks"][0]["id"], task_id.as_str());
        assert_eq!(leased["tasks"][0]["state"], "STARTED");

        let put = Request::put(format!("/v1/tasks/{task_id}"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"state":"SUCCEEDED","output":{"added":3}}"#))
            .unwrap();
        let resp = router.clone().oneshot(put).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .oneshot(
                Request::get(format!("/v1/tasks/{task_id}/output?waitMs=10"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let out = body_json(resp).await;
        assert_eq!(out["state"], "SUCCEEDED");
        assert_eq!(out["output"]["added"], 3);
    }
}
