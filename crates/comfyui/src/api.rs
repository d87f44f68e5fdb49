//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (health probe, workflow submission,
//! history retrieval, artifact download, cancellation) using
//! [`reqwest`]. The [`EngineApi`] and [`HealthProbe`] traits are the
//! seams the tracker, fetcher and process supervisor depend on.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::history::{HistoryResponse, OutputDescriptor};

/// Per-endpoint request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimeouts {
    /// `GET /system_stats`.
    pub health: Duration,
    /// `POST /prompt`.
    pub submit: Duration,
    /// `GET /history/{prompt_id}`.
    pub history: Duration,
    /// `GET /view`. Artifacts can be large.
    pub view: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(3),
            submit: Duration::from_secs(30),
            history: Duration::from_secs(10),
            view: Duration::from_secs(30),
        }
    }
}

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    timeouts: EngineTimeouts,
}

/// Interpretation of a `POST /prompt` response body.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The workflow was queued.
    Accepted {
        prompt_id: String,
        /// Position in the execution queue, when reported.
        number: Option<i64>,
    },
    /// ComfyUI refused the workflow (validation failure, bad nodes).
    Rejected { detail: String },
    /// Neither a prompt id nor an error was returned.
    MissingPromptId { body: String },
}

impl SubmitOutcome {
    /// Classify a decoded `/prompt` body.
    ///
    /// An `error` field wins over a `prompt_id`. String errors are kept
    /// verbatim; structured errors are rendered as JSON text.
    pub fn from_json(body: &serde_json::Value) -> Self {
        if let Some(error) = body.get("error") {
            let detail = match error {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Self::Rejected { detail };
        }

        match body.get("prompt_id").and_then(prompt_id_text) {
            Some(prompt_id) => Self::Accepted {
                prompt_id,
                number: body.get("number").and_then(serde_json::Value::as_i64),
            },
            None => Self::MissingPromptId {
                body: body.to_string(),
            },
        }
    }
}

fn prompt_id_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code or an unusable body.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Operations the execution tracker and artifact fetcher need from the
/// engine.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Queue a workflow for execution.
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitOutcome, ComfyUIApiError>;

    /// Fetch the history record for one prompt.
    async fn get_history(&self, prompt_id: &str) -> Result<HistoryResponse, ComfyUIApiError>;

    /// Download the bytes of one produced artifact.
    async fn view(&self, descriptor: &OutputDescriptor) -> Result<Bytes, ComfyUIApiError>;

    /// Remove a queued or running prompt.
    async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError>;
}

/// A single readiness check against the engine.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(())` when the engine answers healthy.
    async fn probe(&self) -> Result<(), ComfyUIApiError>;
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            timeouts: EngineTimeouts::default(),
        }
    }

    /// Override the per-endpoint request timeouts.
    pub fn with_timeouts(mut self, timeouts: EngineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// HTTP API base URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Check that the server answers `GET /system_stats` with 200.
    pub async fn system_stats(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(self.timeouts.health)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. The body is decoded even on a 4xx status because
    /// ComfyUI reports validation failures as `{"error": ...}` with 400.
    pub async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitOutcome, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(self.timeouts.submit)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json) => Ok(SubmitOutcome::from_json(&json)),
            Err(_) => Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body: text,
            }),
        }
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The response is empty
    /// until the prompt has been picked up by the executor.
    pub async fn history(&self, prompt_id: &str) -> Result<HistoryResponse, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(self.timeouts.history)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download an output file via `GET /view`.
    pub async fn download(&self, descriptor: &OutputDescriptor) -> Result<Bytes, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", descriptor.filename.as_str()),
                ("subfolder", descriptor.subfolder.as_str()),
                ("type", descriptor.kind.as_str()),
            ])
            .timeout(self.timeouts.view)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?)
    }

    /// Cancel a queued or running execution.
    ///
    /// Sends a `POST /queue` request asking ComfyUI to delete the
    /// specified prompt from the queue.
    pub async fn cancel(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl EngineApi for ComfyUIApi {
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitOutcome, ComfyUIApiError> {
        self.submit(workflow, client_id).await
    }

    async fn get_history(&self, prompt_id: &str) -> Result<HistoryResponse, ComfyUIApiError> {
        self.history(prompt_id).await
    }

    async fn view(&self, descriptor: &OutputDescriptor) -> Result<Bytes, ComfyUIApiError> {
        self.download(descriptor).await
    }

    async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.cancel(prompt_id).await
    }
}

#[async_trait]
impl HealthProbe for ComfyUIApi {
    async fn probe(&self) -> Result<(), ComfyUIApiError> {
        self.system_stats().await
    }
}
