use serde_json::Value;

/// Errors surfaced by template handling, payload preparation, and job
/// orchestration.
///
/// Every variant is fatal for the call that produced it. The only
/// failures that can be swallowed are record-level and sub-job-level
/// [`Workflow`](Self::Workflow) errors when `ignore_errors` is set.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The template does not reference every required variable.
    #[error("Missing variables in workflow template: {}", missing.join(", "))]
    TemplateValidation { missing: Vec<String> },

    /// Rendering failed or did not produce a JSON document.
    #[error("Template render error: {0}")]
    TemplateRender(String),

    /// A chunked result stream ended in the middle of a record.
    #[error("Stream ended with an unterminated record ({pending_bytes} bytes buffered)")]
    ProtocolFraming { pending_bytes: usize },

    /// A complete record was not valid JSON.
    #[error("Malformed stream record: {0}")]
    MalformedRecord(String),

    /// The backend reported a job-level or record-level failure.
    #[error("Workflow failed: {0}")]
    Workflow(Value),

    /// The backend finished streaming without reaching a completed state.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// HTTP / WebSocket failure talking to a backend.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An image could not be encoded or decoded.
    #[error("Image codec error: {0}")]
    ImageCodec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The execution was cancelled before it produced a result.
    #[error("Execution cancelled")]
    Cancelled,
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
