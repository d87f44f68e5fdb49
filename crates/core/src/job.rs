//! Serverless job payloads.
//!
//! A job arrives as `{"id": "...", "input": {"workflow": {...}}}` and
//! always produces exactly one [`JobResult`]: either the generated image
//! or an `{"error": "..."}` object.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One job handed over by the job queue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Job {
    /// Queue-assigned job identifier, when the queue provides one.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: JobInput,
}

/// The `input` object of a [`Job`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    /// ComfyUI API-format workflow graph (node id -> node definition).
    #[serde(default)]
    pub workflow: Option<serde_json::Value>,
}

impl Job {
    /// Decode a job from its raw JSON form.
    pub fn from_value(value: serde_json::Value) -> Result<Self, CoreError> {
        serde_json::from_value(value).map_err(|e| CoreError::Validation(e.to_string()))
    }

    /// Extract the work unit, rejecting a missing or empty workflow.
    pub fn work_unit(&self) -> Result<WorkUnit, CoreError> {
        let workflow = self.input.workflow.clone().ok_or(CoreError::NoWorkflow)?;
        WorkUnit::from_value(workflow)
    }
}

/// A non-empty workflow graph, passed to the engine unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit(serde_json::Value);

impl WorkUnit {
    pub fn from_value(value: serde_json::Value) -> Result<Self, CoreError> {
        if is_empty_value(&value) {
            return Err(CoreError::NoWorkflow);
        }
        Ok(Self(value))
    }

    /// Number of top-level nodes (1 for a non-object graph).
    pub fn node_count(&self) -> usize {
        match &self.0 {
            serde_json::Value::Object(nodes) => nodes.len(),
            _ => 1,
        }
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` all count as "no workflow".
fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Bool(b) => !b,
        serde_json::Value::Number(n) => n.as_f64() == Some(0.0),
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
    }
}

/// The single result returned to the job queue for every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Success {
        /// Base64-encoded artifact bytes.
        image: String,
        filename: String,
        prompt_id: String,
    },
    Error {
        error: String,
    },
}

impl JobResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<CoreError> for JobResult {
    fn from(err: CoreError) -> Self {
        Self::error(err.to_string())
    }
}
