//! # Syncflow Gateway
//! HTTP API for the task orchestrator, plus a typed client for workers.
//!
//! ## Routes
//! - `GET  /health`
//! - `POST /v1/immediate`, `POST /v1/recurring`, `PUT /v1/recurring/{scheduleId}`
//! - `POST /v1/schedules/{scheduleId}/run`
//! - `POST /v1/tasks/search`, `POST /v1/schedules/search`
//! - `POST /v1/dequeue`, `POST /v1/tasks/{taskId}/heartbeat`
//! - `GET|PUT /v1/tasks/{taskId}`, `GET /v1/tasks/{taskId}/output?waitMs=`

pub mod api;
pub mod client;
pub mod routes;
pub mod server;

pub use client::{ClientError, OrchestratorClient};
pub use server::{AppState, build_router, start};
