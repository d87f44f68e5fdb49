//! Job listener boundary.
//!
//! A [`JobListener`] feeds jobs to a [`HandleJob`] one at a time and
//! reports each result back to wherever the job came from. The bundled
//! [`LocalListener`] reads jobs from a file or stdin and writes one JSON
//! result line per job to stdout.

use std::path::Path;

use async_trait::async_trait;
use indus_core::job::{Job, JobResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::handler::HandleJob;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Job I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode job result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Source of jobs. Only served once the engine is ready.
#[async_trait]
pub trait JobListener: Send {
    /// Serve jobs sequentially until the source is exhausted or
    /// shutdown is requested. Returns the number of jobs handled.
    async fn serve(&mut self, handler: &dyn HandleJob) -> Result<u64, ListenerError>;
}

/// How the input stream is split into jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// The whole input is one JSON job.
    Document,
    /// One JSON job per line.
    Lines,
}

pub struct LocalListener<R, W> {
    reader: R,
    writer: W,
    mode: InputMode,
    cancel: CancellationToken,
}

impl LocalListener<BufReader<tokio::fs::File>, tokio::io::Stdout> {
    /// Serve the single job stored in `path`.
    pub async fn open_file(path: &Path, cancel: CancellationToken) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(
            BufReader::new(file),
            tokio::io::stdout(),
            InputMode::Document,
            cancel,
        ))
    }
}

impl LocalListener<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    /// Serve JSON-lines jobs from stdin.
    pub fn stdin(cancel: CancellationToken) -> Self {
        Self::new(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            InputMode::Lines,
            cancel,
        )
    }
}

impl<R, W> LocalListener<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, mode: InputMode, cancel: CancellationToken) -> Self {
        Self {
            reader,
            writer,
            mode,
            cancel,
        }
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    async fn handle_text(&mut self, text: &str, handler: &dyn HandleJob) -> Result<(), ListenerError> {
        let result = match parse_job(text) {
            Ok(job) => handler.handle(job).await,
            Err(result) => result,
        };
        self.write_result(&result).await
    }

    async fn write_result(&mut self, result: &JobResult) -> Result<(), ListenerError> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn serve_document(&mut self, handler: &dyn HandleJob) -> Result<u64, ListenerError> {
        let mut text = String::new();
        self.reader.read_to_string(&mut text).await?;
        self.handle_text(&text, handler).await?;
        Ok(1)
    }

    async fn serve_lines(&mut self, handler: &dyn HandleJob) -> Result<u64, ListenerError> {
        let mut handled = 0;
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Job listener shutting down");
                    break;
                }
                read = self.reader.read_line(&mut line) => read?,
            };
            if read == 0 {
                tracing::info!(handled, "Job input exhausted");
                break;
            }

            let text = line.trim().to_string();
            if text.is_empty() {
                continue;
            }
            self.handle_text(&text, handler).await?;
            handled += 1;
        }

        Ok(handled)
    }
}

#[async_trait]
impl<R, W> JobListener for LocalListener<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn serve(&mut self, handler: &dyn HandleJob) -> Result<u64, ListenerError> {
        tracing::info!(mode = ?self.mode, "Listening for jobs");
        match self.mode {
            InputMode::Document => self.serve_document(handler).await,
            InputMode::Lines => self.serve_lines(handler).await,
        }
    }
}

/// Decode one job, or the error result to report for it.
fn parse_job(text: &str) -> Result<Job, JobResult> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| JobResult::error(format!("Invalid job: {e}")))?;
    Job::from_value(value).map_err(|e| JobResult::error(format!("Invalid job: {e}")))
}
