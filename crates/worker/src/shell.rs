//! A job that runs an external program on the worker host.
//!
//! This is the job type the `jobmq-worker` binary serves. A non-zero exit,
//! a timeout or a spawn failure is reported as a failed [`JobResult`];
//! the reply is still sent, so the dispatcher learns about it.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobmq_core::{Job, JobResult};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Stops runaway programs when the job does not set its own limit.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Maximum stdout or stderr kept per stream (1 MiB).
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellJob {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ShellJob {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_secs: None,
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

#[async_trait]
impl Job for ShellJob {
    async fn execute(&mut self) -> JobResult {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return JobResult::failure(format!("failed to spawn {}: {e}", self.program)),
        };

        let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

        // On timeout the child is dropped, which kills it.
        let status = match tokio::time::timeout(self.timeout(), child.wait()).await {
            Ok(Ok(status)) => status,
            failed => {
                stdout_task.abort();
                stderr_task.abort();
                return JobResult::failure(match failed {
                    Ok(Err(e)) => format!("{} failed: {e}", self.program),
                    _ => format!(
                        "{} timed out after {}s",
                        self.program,
                        self.timeout().as_secs()
                    ),
                });
            }
        };

        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
        let exit_code = status.code().unwrap_or(-1);
        tracing::debug!(
            program = %self.program,
            exit_code,
            duration_ms,
            "Shell job finished",
        );

        let result = if status.success() {
            JobResult::success()
        } else {
            let stderr = String::from_utf8_lossy(&stderr_bytes);
            let reason = stderr.trim();
            JobResult::failure(if reason.is_empty() {
                format!("{} exited with code {exit_code}", self.program)
            } else {
                reason.to_string()
            })
        };

        result.with_output(serde_json::json!({
            "stdout": stdout,
            "exit_code": exit_code,
            "duration_ms": duration_ms,
        }))
    }
}

/// Keep the first [`MAX_OUTPUT_BYTES`] of a stream. The remainder is read
/// and discarded until the program closes it.
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
