//! Endpoint and job handles.
//!
//! [`RunPodEndpoint`] submits jobs; each submission returns a
//! [`RunPodJob`] used to poll status and pull streamed output. All calls
//! block the current thread, so they belong on a worker thread when used
//! from async code.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use comfyexec_core::JobStatus;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::{
    is_final_status, parse_status, RunPodError, RunResponse, StatusResponse, StreamResponse,
};

/// Public RunPod serverless API root.
pub const DEFAULT_BASE_URL: &str = "https://api.runpod.ai/v2";

/// Delay between `/stream` fetches while a job is still producing output.
pub const DEFAULT_STREAM_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct EndpointInner {
    /// Built on first use so that constructing an endpoint never spins up
    /// the blocking client's runtime inside an async context.
    http: OnceLock<Client>,
    base_url: String,
    endpoint_id: String,
    api_key: String,
    stream_poll_interval: Duration,
}

impl EndpointInner {
    fn http(&self) -> &Client {
        self.http.get_or_init(Client::new)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.endpoint_id, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.api_key)
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RunPodError> {
        let response = self.authorize(self.http().get(self.url(path))).send()?;
        parse_response(response)
    }
}

/// A RunPod serverless endpoint.
///
/// Cheap to clone; clones share the HTTP client.
#[derive(Clone)]
pub struct RunPodEndpoint {
    inner: Arc<EndpointInner>,
}

impl RunPodEndpoint {
    /// Create a handle for `endpoint_id`, authenticating with `api_key`.
    pub fn new(endpoint_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_options(
            endpoint_id,
            api_key,
            DEFAULT_BASE_URL,
            DEFAULT_STREAM_POLL_INTERVAL,
        )
    }

    /// Create a handle against a non-default API root or stream cadence.
    pub fn with_options(
        endpoint_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        stream_poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                http: OnceLock::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                endpoint_id: endpoint_id.into(),
                api_key: api_key.into(),
                stream_poll_interval,
            }),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.inner.endpoint_id
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Submit a job. Sends `POST /run` with `payload` as the body.
    pub fn run<P: Serialize + ?Sized>(&self, payload: &P) -> Result<RunPodJob, RunPodError> {
        let request = self
            .inner
            .authorize(self.inner.http().post(self.inner.url("run")))
            .json(payload);
        let response: RunResponse = parse_response(request.send()?)?;

        tracing::info!(
            endpoint_id = %self.inner.endpoint_id,
            job_id = %response.id,
            status = response.status.as_deref().unwrap_or("unknown"),
            "Submitted RunPod job",
        );

        Ok(RunPodJob {
            inner: Arc::clone(&self.inner),
            job_id: response.id,
        })
    }
}

impl std::fmt::Debug for RunPodEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPodEndpoint")
            .field("base_url", &self.inner.base_url)
            .field("endpoint_id", &self.inner.endpoint_id)
            .finish_non_exhaustive()
    }
}

/// A submitted job.
#[derive(Clone)]
pub struct RunPodJob {
    inner: Arc<EndpointInner>,
    job_id: String,
}

impl RunPodJob {
    /// RunPod's own job id.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Fetch the current job status.
    pub fn status(&self) -> Result<JobStatus, RunPodError> {
        let response = self.fetch_status()?;
        parse_status(&response.status)
    }

    /// Fetch the job's failure payload (or final output).
    pub fn output(&self) -> Result<Value, RunPodError> {
        Ok(self.fetch_status()?.failure_payload())
    }

    /// Stream the job's output chunks until the job reaches a final state
    /// or `cancel` fires.
    pub fn stream(&self, cancel: CancellationToken) -> JobStream {
        JobStream {
            job: self.clone(),
            pending: VecDeque::new(),
            fetched_once: false,
            done: false,
            cancel,
        }
    }

    fn fetch_status(&self) -> Result<StatusResponse, RunPodError> {
        self.inner.get(&format!("status/{}", self.job_id))
    }

    fn fetch_stream(&self) -> Result<StreamResponse, RunPodError> {
        self.inner.get(&format!("stream/{}", self.job_id))
    }
}

impl std::fmt::Debug for RunPodJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPodJob")
            .field("endpoint_id", &self.inner.endpoint_id)
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// Blocking iterator over a job's streamed text chunks.
///
/// Fetches `/stream/{job_id}` repeatedly, yielding every chunk in order,
/// and stops once a fetch returns no chunks for a job in a final state.
/// A request error is yielded once and ends the stream. The cancellation
/// token is checked before every sleep and every fetch; once it fires
/// the stream yields [`RunPodError::Cancelled`] and ends.
pub struct JobStream {
    job: RunPodJob,
    pending: VecDeque<String>,
    fetched_once: bool,
    done: bool,
    cancel: CancellationToken,
}

impl JobStream {
    fn cancelled(&mut self) -> Option<Result<String, RunPodError>> {
        tracing::debug!(job_id = %self.job.job_id, "RunPod stream cancelled");
        self.done = true;
        self.pending.clear();
        Some(Err(RunPodError::Cancelled))
    }
}

impl Iterator for JobStream {
    type Item = Result<String, RunPodError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(Ok(chunk));
            }
            if self.done {
                return None;
            }

            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            if self.fetched_once {
                std::thread::sleep(self.job.inner.stream_poll_interval);
                if self.cancel.is_cancelled() {
                    return self.cancelled();
                }
            }
            self.fetched_once = true;

            match self.job.fetch_stream() {
                Ok(response) => {
                    if response.stream.is_empty() && is_final_status(&response.status) {
                        tracing::debug!(
                            job_id = %self.job.job_id,
                            status = %response.status,
                            "RunPod stream finished",
                        );
                        self.done = true;
                        continue;
                    }
                    self.pending
                        .extend(response.stream.into_iter().map(|chunk| chunk.into_text()));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Check the status code, then decode the JSON body.
fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T, RunPodError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(RunPodError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<T>()?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_scoped_to_endpoint() {
        let endpoint = RunPodEndpoint::with_options(
            "abc123",
            "key",
            "http://localhost:8000/v2/",
            Duration::ZERO,
        );
        assert_eq!(endpoint.base_url(), "http://localhost:8000/v2");
        assert_eq!(
            endpoint.inner.url("status/job-1"),
            "http://localhost:8000/v2/abc123/status/job-1"
        );
    }

    #[test]
    fn default_endpoint_targets_public_api() {
        let endpoint = RunPodEndpoint::new("abc123", "key");
        assert_eq!(endpoint.base_url(), DEFAULT_BASE_URL);
        assert_eq!(endpoint.endpoint_id(), "abc123");
    }

    #[test]
    fn construction_does_not_build_http_client() {
        let endpoint = RunPodEndpoint::new("abc123", "key");
        assert!(endpoint.inner.http.get().is_none());
    }

    #[test]
    fn cancelled_stream_ends_without_fetching() {
        let endpoint = RunPodEndpoint::new("abc123", "key");
        let job = RunPodJob {
            inner: Arc::clone(&endpoint.inner),
            job_id: "job-1".to_string(),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut stream = job.stream(cancel);
        assert!(matches!(stream.next(), Some(Err(RunPodError::Cancelled))));
        assert!(stream.next().is_none());
        assert!(endpoint.inner.http.get().is_none());
    }

    #[test]
    fn cancelled_stream_maps_to_cancelled_executor_error() {
        let err: comfyexec_core::ExecutorError = RunPodError::Cancelled.into();
        assert!(matches!(err, comfyexec_core::ExecutorError::Cancelled));
    }

    #[test]
    fn debug_output_hides_api_key() {
        let endpoint = RunPodEndpoint::new("abc123", "super-secret");
        assert!(!format!("{endpoint:?}").contains("super-secret"));
    }
}
