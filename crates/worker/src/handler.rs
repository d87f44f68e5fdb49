//! Per-job entry point.
//!
//! [`JobHandler`] turns one job into one [`JobResult`]: validate the
//! workflow, queue it, wait for outputs, download the first image and
//! return it base64-encoded. Every failure, including a panic, becomes
//! an `{"error": ...}` result so the worker stays up for the next job.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use futures::FutureExt;
use indus_comfyui::api::EngineApi;
use indus_comfyui::artifact::{ArtifactFetcher, FetchError};
use indus_comfyui::tracker::{ExecutionError, ExecutionTracker, TrackerConfig};
use indus_core::error::CoreError;
use indus_core::job::{Job, JobResult};
use tracing::Instrument;

/// Anything that can serve jobs handed over by a listener.
#[async_trait]
pub trait HandleJob: Send + Sync {
    async fn handle(&self, job: Job) -> JobResult;
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Input(#[from] CoreError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("No images generated")]
    NoImages,

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

pub struct JobHandler {
    tracker: ExecutionTracker,
    fetcher: ArtifactFetcher,
}

impl JobHandler {
    pub fn new(api: Arc<dyn EngineApi>, tracker_config: TrackerConfig) -> Self {
        Self {
            tracker: ExecutionTracker::new(Arc::clone(&api), tracker_config),
            fetcher: ArtifactFetcher::new(api),
        }
    }

    async fn run(&self, job: &Job) -> Result<JobResult, JobError> {
        let work = job.work_unit()?;
        tracing::info!(node_count = work.node_count(), "Received workflow");

        let submission = self.tracker.submit(&work).await?;
        tracing::Span::current().record("prompt_id", submission.prompt_id.as_str());

        let images = self.tracker.await_outputs(&submission).await?;
        let Some(first) = images.first() else {
            return Err(JobError::NoImages);
        };
        if images.len() > 1 {
            tracing::debug!(discarded = images.len() - 1, "Returning only the first image");
        }

        let data = self.fetcher.fetch(first).await?;
        let image = base64::engine::general_purpose::STANDARD.encode(&data);
        tracing::info!(filename = %first.filename, bytes = data.len(), "Job completed");

        Ok(JobResult::Success {
            image,
            filename: first.filename.clone(),
            prompt_id: submission.prompt_id,
        })
    }
}

#[async_trait]
impl HandleJob for JobHandler {
    async fn handle(&self, job: Job) -> JobResult {
        let span = tracing::info_span!(
            "job",
            job_id = job.id.as_deref().unwrap_or("-"),
            prompt_id = tracing::field::Empty,
        );

        async {
            match AssertUnwindSafe(self.run(&job)).catch_unwind().await {
                Ok(Ok(result)) => result,
                Ok(Err(JobError::Input(e))) => {
                    tracing::warn!(error = %e, "Rejected job input");
                    JobResult::from(e)
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, detail = ?e, "Job failed");
                    JobResult::error(e.to_string())
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(panic = %message, "Job handler panicked");
                    JobResult::error(format!("Internal error: {message}"))
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
