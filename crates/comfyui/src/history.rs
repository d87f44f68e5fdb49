//! ComfyUI `/history` response types and classification.
//!
//! `GET /history/{prompt_id}` returns `{}` until the prompt is picked up,
//! then `{"<prompt_id>": {"status": {...}, "outputs": {...}}}`. Every
//! field of an entry is optional: a missing field, an explicit `null` or
//! a value of the wrong shape all decode to the field's default, so one
//! odd field never hides the rest of the entry.
//! [`HistoryResponse::state_of`] reduces a response to an
//! [`ExecutionState`].

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// `status_str` value ComfyUI reports for a failed execution.
pub const STATUS_ERROR: &str = "error";

/// Message name carrying the failure details inside `status.messages`.
const MSG_EXECUTION_ERROR: &str = "execution_error";

/// Fallback when ComfyUI reports an error without a message.
const UNKNOWN_ERROR: &str = "unknown";

/// Locator for one produced artifact, as listed under a node's `images`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage category (`output`, `temp`, `input`).
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

/// Body of a `GET /history/{prompt_id}` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct HistoryResponse {
    pub entries: HashMap<String, HistoryEntry>,
}

/// Execution record of one prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<HistoryStatus>,
    /// Node id -> node output, in the order ComfyUI reported them.
    #[serde(default, deserialize_with = "lenient")]
    pub outputs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default, deserialize_with = "lenient")]
    pub status_str: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub completed: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub exception_message: Option<String>,
    /// `[name, data]` pairs recorded during execution.
    #[serde(default, deserialize_with = "lenient")]
    pub messages: Vec<serde_json::Value>,
}

/// Decode a field, falling back to `T::default()` for `null` or a value
/// of the wrong shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Ignoring malformed history field");
        T::default()
    }))
}

/// Payload of an `execution_error` status message.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub node_id: Option<String>,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeOutput {
    #[serde(default)]
    images: Option<Vec<OutputDescriptor>>,
}

/// What one history poll says about a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    /// Not in history yet (queued, or not scheduled).
    Absent,
    /// In history but with neither an error nor image outputs.
    Pending,
    /// ComfyUI reported the execution as failed.
    Failed { message: String },
    /// The first node output section carrying an `images` list.
    Completed { images: Vec<OutputDescriptor> },
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Completed { .. })
    }
}

impl HistoryResponse {
    /// Classify the record for `prompt_id`.
    ///
    /// An error status wins over outputs. Among output sections the
    /// first one with an `images` key wins, even if it is empty.
    pub fn state_of(&self, prompt_id: &str) -> ExecutionState {
        let Some(entry) = self.entries.get(prompt_id) else {
            return ExecutionState::Absent;
        };

        if let Some(status) = &entry.status {
            if status.status_str.as_deref() == Some(STATUS_ERROR) {
                return ExecutionState::Failed {
                    message: status.error_message(),
                };
            }
        }

        match entry.first_images() {
            Some(images) => ExecutionState::Completed { images },
            None => ExecutionState::Pending,
        }
    }
}

impl HistoryEntry {
    fn first_images(&self) -> Option<Vec<OutputDescriptor>> {
        self.outputs.iter().find_map(|(node_id, output)| {
            match NodeOutput::deserialize(output) {
                Ok(NodeOutput { images }) => images,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Skipping malformed node output");
                    None
                }
            }
        })
    }
}

impl HistoryStatus {
    /// `exception_message` if present, else the first `execution_error`
    /// message, else `"unknown"`.
    pub fn error_message(&self) -> String {
        if let Some(message) = &self.exception_message {
            return message.clone();
        }
        self.execution_error()
            .map(|data| data.exception_message)
            .unwrap_or_else(|| UNKNOWN_ERROR.to_string())
    }

    /// The first `["execution_error", {...}]` entry in `messages`.
    pub fn execution_error(&self) -> Option<ErrorData> {
        self.messages.iter().find_map(|message| {
            let pair = message.as_array()?;
            match pair.as_slice() {
                [name, data] if name.as_str() == Some(MSG_EXECUTION_ERROR) => {
                    ErrorData::deserialize(data).ok()
                }
                _ => None,
            }
        })
    }
}
