//! HTTP control daemon
//!
//! A small axum server exposing status, task, and lifecycle endpoints.
//! Pause and stop flip flags shared with the orchestrator; stop also
//! triggers the server's own graceful shutdown.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;
use understore::now_ms;

use crate::ratelimit::{RateLimitTracker, UsageWindow};
use crate::state::StateManager;

/// Shared daemon state handed to every handler
pub struct DaemonContext {
    pub state: StateManager,
    pub tracker: Arc<RateLimitTracker>,
    pub paused: Arc<AtomicBool>,
    pub stopping: Arc<AtomicBool>,
    pub started_at: i64,
    pub port: u16,
    shutdown: Notify,
}

impl DaemonContext {
    pub fn new(
        state: StateManager,
        tracker: Arc<RateLimitTracker>,
        paused: Arc<AtomicBool>,
        stopping: Arc<AtomicBool>,
        port: u16,
    ) -> Self {
        Self {
            state,
            tracker,
            paused,
            stopping,
            started_at: now_ms(),
            port,
            shutdown: Notify::new(),
        }
    }
}

/// `GET /status` response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon: DaemonInfo,
    pub session: SessionInfo,
    pub agents: Vec<AgentInfo>,
    pub tasks: TaskCounts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub port: u16,
    pub pid: u32,
    /// Uptime in milliseconds
    pub uptime: i64,
    pub paused: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub batch_id: Option<String>,
    pub started_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentInfo {
    pub task_id: String,
    pub objective: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    #[serde(rename = "inProgress")]
    pub in_progress: u64,
    pub complete: u64,
}

#[derive(Debug, Deserialize)]
struct AddTaskRequest {
    objective: String,
    priority: Option<i32>,
}

/// The control server
pub struct ControlServer;

impl ControlServer {
    /// Bind and return the bound address plus a future that runs the
    /// server until `POST /stop`
    pub async fn serve_with_addr(
        context: Arc<DaemonContext>,
        port: u16,
    ) -> eyre::Result<(std::net::SocketAddr, impl Future<Output = eyre::Result<()>>)> {
        let app = Router::new()
            .route("/status", get(status_handler))
            .route("/tasks", get(tasks_handler).post(add_task_handler))
            .route("/metrics", get(metrics_handler))
            .route("/pause", post(pause_handler))
            .route("/resume", post(resume_handler))
            .route("/stop", post(stop_handler))
            .with_state(context.clone());

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "Control daemon listening");

        let server = async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    context.shutdown.notified().await;
                })
                .await?;
            info!("Control daemon stopped");
            Ok(())
        };

        Ok((addr, server))
    }
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

async fn status_handler(State(context): State<Arc<DaemonContext>>) -> Response {
    let metrics = match context.state.board_metrics().await {
        Ok(metrics) => metrics,
        Err(e) => return internal_error(e),
    };

    let agents = match context.state.list_tasks(Some("in_progress"), None).await {
        Ok(tasks) => tasks
            .into_iter()
            .map(|t| AgentInfo {
                task_id: t.id,
                objective: t.objective,
            })
            .collect(),
        Err(e) => return internal_error(e),
    };

    let session = match context.state.list_batches().await {
        Ok(batches) => batches
            .last()
            .map(|b| SessionInfo {
                batch_id: Some(b.id.clone()),
                started_at: Some(b.started_at),
            })
            .unwrap_or_default(),
        Err(e) => return internal_error(e),
    };

    let response = StatusResponse {
        daemon: DaemonInfo {
            port: context.port,
            pid: std::process::id(),
            uptime: now_ms() - context.started_at,
            paused: context.paused.load(Ordering::SeqCst),
        },
        session,
        agents,
        tasks: TaskCounts {
            pending: metrics.pending,
            in_progress: metrics.in_progress,
            complete: metrics.complete,
        },
    };
    Json(response).into_response()
}

async fn tasks_handler(State(context): State<Arc<DaemonContext>>) -> Response {
    match context.state.list_tasks(None, None).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn add_task_handler(
    State(context): State<Arc<DaemonContext>>,
    Json(request): Json<AddTaskRequest>,
) -> Response {
    if request.objective.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "objective must not be empty").into_response();
    }

    let mut task = crate::domain::Task::new(request.objective);
    if let Some(priority) = request.priority {
        task.set_priority(priority);
    }

    match context.state.create_task(task.clone()).await {
        Ok(id) => (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn metrics_handler(State(context): State<Arc<DaemonContext>>) -> Response {
    let mut usage = HashMap::new();
    for window in UsageWindow::ALL {
        usage.insert(window.name(), context.tracker.get_usage_percentage(window));
    }
    let snapshot = context.tracker.snapshot();

    Json(serde_json::json!({
        "usage": usage,
        "total-calls": snapshot.total_calls,
        "total-input-tokens": snapshot.total_input_tokens,
        "total-output-tokens": snapshot.total_output_tokens,
        "paused": context.tracker.is_paused(),
        "hits": snapshot.hits.len(),
    }))
    .into_response()
}

async fn pause_handler(State(context): State<Arc<DaemonContext>>) -> Response {
    context.paused.store(true, Ordering::SeqCst);
    info!("Daemon paused");
    Json(serde_json::json!({ "paused": true })).into_response()
}

async fn resume_handler(State(context): State<Arc<DaemonContext>>) -> Response {
    context.paused.store(false, Ordering::SeqCst);
    info!("Daemon resumed");
    Json(serde_json::json!({ "paused": false })).into_response()
}

async fn stop_handler(State(context): State<Arc<DaemonContext>>) -> Response {
    info!("Daemon stop requested");
    context.stopping.store(true, Ordering::SeqCst);
    context.shutdown.notify_waiters();
    Json(serde_json::json!({ "stopping": true })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::state::test_support::temp_state;

    async fn spawn_server(state: &StateManager) -> (std::net::SocketAddr, Arc<DaemonContext>, tokio::task::JoinHandle<()>) {
        let context = Arc::new(DaemonContext::new(
            state.clone(),
            Arc::new(RateLimitTracker::new(RateLimitConfig::default())),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            0,
        ));

        let (addr, server) = ControlServer::serve_with_addr(context.clone(), 0).await.unwrap();
        let handle = tokio::spawn(async move {
            let _ = server.await;
        });
        (addr, context, handle)
    }

    #[tokio::test]
    async fn test_status_and_tasks_endpoints() {
        let (_temp, state) = temp_state();
        state
            .create_task(crate::domain::Task::with_id("t1", "do the thing"))
            .await
            .unwrap();

        let (addr, context, handle) = spawn_server(&state).await;
        let client = reqwest::Client::new();

        let status: StatusResponse = client
            .get(format!("http://{}/status", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.tasks.pending, 1);
        assert_eq!(status.daemon.pid, std::process::id());
        assert!(!status.daemon.paused);

        let tasks: Vec<crate::domain::Task> = client
            .get(format!("http://{}/tasks", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);

        context.shutdown.notify_waiters();
        handle.await.unwrap();
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_task_endpoint() {
        let (_temp, state) = temp_state();
        let (addr, context, handle) = spawn_server(&state).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{}/tasks", addr))
            .json(&serde_json::json!({ "objective": "new work", "priority": 3 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);

        let tasks = state.list_tasks(None, None).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, 3);

        // Empty objective is rejected
        let response = client
            .post(format!("http://{}/tasks", addr))
            .json(&serde_json::json!({ "objective": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        context.shutdown.notify_waiters();
        handle.await.unwrap();
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_and_stop() {
        let (_temp, state) = temp_state();
        let (addr, context, handle) = spawn_server(&state).await;
        let client = reqwest::Client::new();

        client.post(format!("http://{}/pause", addr)).send().await.unwrap();
        assert!(context.paused.load(Ordering::SeqCst));

        client.post(format!("http://{}/resume", addr)).send().await.unwrap();
        assert!(!context.paused.load(Ordering::SeqCst));

        // Stop sets the flag and shuts the server down
        client.post(format!("http://{}/stop", addr)).send().await.unwrap();
        assert!(context.stopping.load(Ordering::SeqCst));
        handle.await.unwrap();

        // Server is gone
        assert!(client.get(format!("http://{}/status", addr)).send().await.is_err());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (_temp, state) = temp_state();
        let (addr, context, handle) = spawn_server(&state).await;

        context.tracker.record_usage(crate::domain::ModelTier::Mid, 100, 10);

        let metrics: serde_json::Value = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics["total-calls"], 1);
        assert!(metrics["usage"]["5h"].as_f64().unwrap() > 0.0);

        context.shutdown.notify_waiters();
        handle.await.unwrap();
        state.shutdown().await.unwrap();
    }
}
