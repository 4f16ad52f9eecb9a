//! Client for the control daemon
//!
//! Used by the `daemon` and `status` CLI subcommands; talks plain JSON to
//! the local daemon.

use eyre::{Context, Result};
use serde_json::Value;

use super::server::StatusResponse;

/// HTTP client for a running control daemon
pub struct DaemonClient {
    base_url: String,
    client: reqwest::Client,
}

impl DaemonClient {
    pub fn new(port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
        }
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.client
            .get(format!("{}/status", self.base_url))
            .send()
            .await
            .context("Daemon not reachable")?
            .json()
            .await
            .context("Invalid status response")
    }

    pub async fn metrics(&self) -> Result<Value> {
        self.client
            .get(format!("{}/metrics", self.base_url))
            .send()
            .await
            .context("Daemon not reachable")?
            .json()
            .await
            .context("Invalid metrics response")
    }

    pub async fn add_task(&self, objective: &str, priority: Option<i32>) -> Result<String> {
        let response: Value = self
            .client
            .post(format!("{}/tasks", self.base_url))
            .json(&serde_json::json!({ "objective": objective, "priority": priority }))
            .send()
            .await
            .context("Daemon not reachable")?
            .json()
            .await
            .context("Invalid add-task response")?;

        response
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| eyre::eyre!("Daemon did not return a task id"))
    }

    pub async fn pause(&self) -> Result<()> {
        self.post_empty("pause").await
    }

    pub async fn resume(&self) -> Result<()> {
        self.post_empty("resume").await
    }

    pub async fn stop(&self) -> Result<()> {
        self.post_empty("stop").await
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        self.client
            .post(format!("{}/{}", self.base_url, path))
            .send()
            .await
            .context("Daemon not reachable")?
            .error_for_status()
            .context("Daemon rejected the request")?;
        Ok(())
    }
}
