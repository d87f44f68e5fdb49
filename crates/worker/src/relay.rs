//! Relay of ComfyUI's console output into the worker's log.
//!
//! Each child pipe is read line by line on its own task until EOF.
//! Lines are trimmed, empty ones dropped, and long ones truncated
//! before being logged under the `comfyui` target.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Longest line (in characters) forwarded to the log.
pub const MAX_LINE_CHARS: usize = 300;

/// Background tasks draining a child's stdout and stderr.
pub struct LogRelay {
    tasks: Vec<JoinHandle<u64>>,
}

impl LogRelay {
    /// Take the child's piped stdout/stderr and start relaying them.
    pub fn attach(child: &mut Child) -> Self {
        let mut tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            tasks.push(tokio::spawn(relay_lines(stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(relay_lines(stderr, "stderr")));
        }
        Self { tasks }
    }

    /// Wait up to `timeout` for both streams to reach EOF, then abort
    /// whatever is still running.
    pub async fn drain(self, timeout: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut forwarded = 0;
        for mut task in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(lines)) => forwarded += lines,
                Ok(Err(e)) => tracing::warn!(error = %e, "Log relay task failed"),
                Err(_) => {
                    tracing::debug!("Abandoning undrained log relay");
                    task.abort();
                }
            }
        }
        forwarded
    }
}

/// Forward every non-empty line of `reader` to the log. Returns the
/// number of lines forwarded once the stream ends.
pub async fn relay_lines<R>(reader: R, stream: &'static str) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    let mut forwarded = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                tracing::info!(target: "comfyui", stream, "{}", truncate_line(line, MAX_LINE_CHARS));
                forwarded += 1;
            }
            Err(e) => {
                tracing::warn!(stream, error = %e, "ComfyUI output stream failed");
                break;
            }
        }
    }

    forwarded
}

/// The first `max_chars` characters of `line`.
pub fn truncate_line(line: &str, max_chars: usize) -> &str {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
