//! Response types and status mapping for the RunPod job API.

use comfyexec_core::{ExecutorError, JobStatus};
use serde::Deserialize;
use serde_json::Value;

/// Errors from the RunPod HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum RunPodError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// RunPod returned a non-2xx status code.
    #[error("RunPod API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response did not match the documented shape.
    #[error("Unexpected RunPod response: {0}")]
    Protocol(String),

    /// The caller stopped waiting for the job's stream.
    #[error("Stream cancelled")]
    Cancelled,
}

impl From<RunPodError> for ExecutorError {
    fn from(err: RunPodError) -> Self {
        match err {
            RunPodError::Cancelled => ExecutorError::Cancelled,
            other => ExecutorError::Transport(other.to_string()),
        }
    }
}

/// Response to `POST /run`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunResponse {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Response to `GET /status/{job_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl StatusResponse {
    /// The payload describing why a job failed: `error` when present,
    /// otherwise `output`.
    pub fn failure_payload(self) -> Value {
        self.error.or(self.output).unwrap_or(Value::Null)
    }
}

/// Response to `GET /stream/{job_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamResponse {
    pub status: String,
    #[serde(default)]
    pub stream: Vec<StreamChunk>,
}

/// One chunk yielded by the worker's generator handler.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    pub output: Value,
}

impl StreamChunk {
    /// Chunk text. Workers stream strings; anything else is passed on as
    /// its JSON text.
    pub fn into_text(self) -> String {
        match self.output {
            Value::String(text) => text,
            other => other.to_string(),
        }
    }
}

/// Map a RunPod status string onto [`JobStatus`].
///
/// `CANCELLED` and `TIMED_OUT` are failures from the caller's point of
/// view.
pub fn parse_status(status: &str) -> Result<JobStatus, RunPodError> {
    match status {
        "IN_QUEUE" => Ok(JobStatus::Queued),
        "IN_PROGRESS" => Ok(JobStatus::Running),
        "COMPLETED" => Ok(JobStatus::Completed),
        "FAILED" | "CANCELLED" | "TIMED_OUT" => Ok(JobStatus::Failed),
        other => Err(RunPodError::Protocol(format!("unknown job status '{other}'"))),
    }
}

/// Whether a RunPod status string means the job will not change again.
pub fn is_final_status(status: &str) -> bool {
    matches!(status, "COMPLETED" | "FAILED" | "CANCELLED" | "TIMED_OUT")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
