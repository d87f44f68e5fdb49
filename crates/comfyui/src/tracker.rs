//! Submit-and-poll execution tracking.
//!
//! [`ExecutionTracker`] queues a work unit with ComfyUI and polls
//! `/history/{prompt_id}` at a fixed interval until the prompt fails,
//! produces images, or the deadline passes. Poll errors are never
//! terminal; only the deadline is.

use std::sync::Arc;
use std::time::Duration;

use indus_core::job::WorkUnit;
use tokio::time::Instant;

use crate::api::{ComfyUIApiError, EngineApi, SubmitOutcome};
use crate::history::{ExecutionState, OutputDescriptor};

/// Default interval between history polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default deadline for a prompt to reach a terminal state.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Ask ComfyUI to drop the prompt when the deadline passes.
    pub cancel_on_timeout: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            cancel_on_timeout: false,
        }
    }
}

/// A prompt accepted by ComfyUI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub prompt_id: String,
    pub queue_number: Option<i64>,
}

/// A prompt that finished with image outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedExecution {
    pub prompt_id: String,
    pub images: Vec<OutputDescriptor>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// ComfyUI answered `/prompt` with an `error` field.
    #[error("Queue error: {detail}")]
    Rejected { detail: String },

    /// ComfyUI answered `/prompt` without a prompt id.
    #[error("No prompt_id returned: {response}")]
    MissingPromptId { response: String },

    /// The `/prompt` request itself failed.
    #[error("Failed to submit workflow: {0}")]
    Submit(#[source] ComfyUIApiError),

    /// The execution finished with `status_str == "error"`.
    #[error("ComfyUI execution error: {message}")]
    EngineFailure { message: String },

    #[error("Generation timed out after {secs}s")]
    Timeout { secs: u64 },
}

pub struct ExecutionTracker {
    api: Arc<dyn EngineApi>,
    config: TrackerConfig,
}

impl ExecutionTracker {
    pub fn new(api: Arc<dyn EngineApi>, config: TrackerConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Queue a work unit. Rejections are terminal; nothing is polled.
    pub async fn submit(&self, work: &WorkUnit) -> Result<Submission, ExecutionError> {
        let client_id = uuid::Uuid::new_v4().to_string();

        let outcome = self
            .api
            .submit_workflow(work.as_value(), &client_id)
            .await
            .map_err(ExecutionError::Submit)?;

        match outcome {
            SubmitOutcome::Accepted { prompt_id, number } => {
                tracing::info!(
                    prompt_id = %prompt_id,
                    queue_number = ?number,
                    "Workflow queued on ComfyUI",
                );
                Ok(Submission {
                    prompt_id,
                    queue_number: number,
                })
            }
            SubmitOutcome::Rejected { detail } => {
                tracing::warn!(detail = %detail, "ComfyUI rejected workflow");
                Err(ExecutionError::Rejected { detail })
            }
            SubmitOutcome::MissingPromptId { body } => {
                tracing::warn!(body = %body, "ComfyUI returned no prompt_id");
                Err(ExecutionError::MissingPromptId { response: body })
            }
        }
    }

    /// Poll history until the prompt reaches a terminal state.
    ///
    /// Returns the image list of the first output section that has one.
    /// Transport and decoding errors during a poll are logged and the
    /// loop continues; they do not extend the deadline.
    pub async fn await_outputs(
        &self,
        submission: &Submission,
    ) -> Result<Vec<OutputDescriptor>, ExecutionError> {
        let prompt_id = submission.prompt_id.as_str();
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut polls = 0u32;

        while Instant::now() < deadline {
            polls += 1;
            match self.api.get_history(prompt_id).await {
                Ok(history) => match history.state_of(prompt_id) {
                    ExecutionState::Absent | ExecutionState::Pending => {
                        tracing::trace!(prompt_id, polls, "Prompt not finished yet");
                    }
                    ExecutionState::Failed { message } => {
                        tracing::error!(
                            prompt_id,
                            polls,
                            exception_message = %message,
                            "ComfyUI execution failed",
                        );
                        return Err(ExecutionError::EngineFailure { message });
                    }
                    ExecutionState::Completed { images } => {
                        tracing::info!(
                            prompt_id,
                            polls,
                            image_count = images.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "ComfyUI execution completed",
                        );
                        return Ok(images);
                    }
                },
                Err(e) => {
                    tracing::debug!(prompt_id, error = %e, "History poll failed, retrying");
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        tracing::error!(
            prompt_id,
            polls,
            timeout_secs = self.config.timeout.as_secs(),
            "Timed out waiting for ComfyUI",
        );

        if self.config.cancel_on_timeout {
            self.cancel_abandoned(prompt_id).await;
        }

        Err(ExecutionError::Timeout {
            secs: self.config.timeout.as_secs(),
        })
    }

    /// Submit a work unit and wait for its outputs.
    pub async fn submit_and_await(
        &self,
        work: &WorkUnit,
    ) -> Result<CompletedExecution, ExecutionError> {
        let submission = self.submit(work).await?;
        let images = self.await_outputs(&submission).await?;
        Ok(CompletedExecution {
            prompt_id: submission.prompt_id,
            images,
        })
    }

    async fn cancel_abandoned(&self, prompt_id: &str) {
        match self.api.cancel_execution(prompt_id).await {
            Ok(()) => tracing::info!(prompt_id, "Cancelled timed-out prompt"),
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Failed to cancel timed-out prompt");
            }
        }
    }
}
