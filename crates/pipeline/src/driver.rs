//! Blocking job driver for polling backends.
//!
//! [`BlockingJobDriver::run`] submits a payload and returns a
//! [`JobOutputs`] iterator. Iterating it polls the job while queued,
//! then reassembles the job's result stream into records and yields one
//! [`WorkflowOutputImage`] per image entry, in record order. Every call
//! blocks; run it on a worker thread from async code (see
//! [`crate::bridge`]).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use comfyexec_core::codec;
use comfyexec_core::framing::RecordReassembler;
use comfyexec_core::payload::JobPayload;
use comfyexec_core::{ExecutorError, ExecutorResult, JobStatus, WorkflowOutputImage};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::transport::{ChunkStream, PolledJob, PollingTransport};

/// Delay between status polls while a job is queued.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Submits payloads to a polling backend.
pub struct BlockingJobDriver<T> {
    transport: Arc<T>,
    poll_interval: Duration,
    span: Span,
}

impl<T> Clone for BlockingJobDriver<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            poll_interval: self.poll_interval,
            span: self.span.clone(),
        }
    }
}

impl<T: PollingTransport> BlockingJobDriver<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            poll_interval: DEFAULT_POLL_INTERVAL,
            span: Span::none(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Emit all driver events inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Submit `payload` and return the job's lazily produced outputs.
    ///
    /// With `ignore_errors`, records carrying an `error` are logged and
    /// skipped instead of failing the iteration.
    pub fn run(&self, payload: &JobPayload, ignore_errors: bool) -> ExecutorResult<JobOutputs<T::Job>> {
        let _entered = self.span.enter();
        let job = self.transport.submit(payload)?;
        tracing::info!(
            job_id = %job.id(),
            batch_count = payload.input.batch_count,
            images = payload.input.images.len(),
            "Job submitted",
        );

        Ok(JobOutputs {
            job,
            state: DriverState::Polling,
            pending: VecDeque::new(),
            poll_interval: self.poll_interval,
            ignore_errors,
            cancel: CancellationToken::new(),
            span: self.span.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Output iteration
// ---------------------------------------------------------------------------

enum DriverState {
    /// Waiting for the job to leave the queue.
    Polling,
    Streaming(RecordReassembler<ChunkStream>),
    Done,
}

/// Lazily produced outputs of one polled job.
///
/// Yields images as records arrive. The first error ends the iteration.
pub struct JobOutputs<J> {
    job: J,
    state: DriverState,
    pending: VecDeque<WorkflowOutputImage>,
    poll_interval: Duration,
    ignore_errors: bool,
    cancel: CancellationToken,
    span: Span,
}

/// One streamed record. Both fields may be absent (heartbeat).
#[derive(Debug, Default, Deserialize)]
struct StreamRecord {
    #[serde(default)]
    images: Vec<RecordImage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RecordImage {
    /// Base64-encoded image bytes.
    image: String,
    name: String,
    #[serde(default)]
    subfolder: Option<String>,
}

impl<J: PolledJob> JobOutputs<J> {
    /// Stop with [`ExecutorError::Cancelled`] once `token` fires, whether
    /// the job is still queued or already streaming.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Open the job's stream, failing every pull after cancellation.
    fn open_stream(&self) -> ChunkStream {
        let mut chunks = self.job.stream(&self.cancel);
        let cancel = self.cancel.clone();
        Box::new(std::iter::from_fn(move || {
            if cancel.is_cancelled() {
                return Some(Err(ExecutorError::Cancelled));
            }
            chunks.next()
        }))
    }

    /// Poll until the job is no longer queued.
    fn wait_until_started(&self) -> ExecutorResult<()> {
        loop {
            match self.job.status()? {
                JobStatus::Queued => {
                    if self.is_cancelled() {
                        return Err(ExecutorError::Cancelled);
                    }
                    tracing::trace!(job_id = %self.job.id(), "Job queued, polling");
                    std::thread::sleep(self.poll_interval);
                }
                JobStatus::Failed => {
                    let payload = self.job.output()?;
                    tracing::error!(job_id = %self.job.id(), error = %payload, "Job failed");
                    return Err(ExecutorError::Workflow(payload));
                }
                status @ (JobStatus::Running | JobStatus::Completed) => {
                    tracing::debug!(job_id = %self.job.id(), %status, "Job started, streaming output");
                    return Ok(());
                }
            }
        }
    }

    /// Parse one record, queueing its images.
    fn accept_record(&mut self, record: &str) -> ExecutorResult<()> {
        let record = record.trim();
        if record.is_empty() {
            return Ok(());
        }

        let Some(record) = serde_json::from_str::<Option<StreamRecord>>(record)
            .map_err(|e| ExecutorError::MalformedRecord(e.to_string()))?
        else {
            return Ok(());
        };

        if let Some(error) = record.error.filter(|error| !error.is_null()) {
            if !self.ignore_errors {
                return Err(ExecutorError::Workflow(error));
            }
            tracing::warn!(job_id = %self.job.id(), %error, "Skipping failed record");
            return Ok(());
        }

        let images = record
            .images
            .into_iter()
            .map(|entry| {
                let image = codec::decode_base64(&entry.image)?;
                Ok(WorkflowOutputImage::new(image, entry.name, entry.subfolder))
            })
            .collect::<ExecutorResult<Vec<_>>>()?;

        tracing::debug!(job_id = %self.job.id(), images = images.len(), "Record received");
        self.pending.extend(images);
        Ok(())
    }

    /// The stream is drained; the job must have completed.
    fn ensure_completed(&self) -> ExecutorResult<()> {
        match self.job.status()? {
            JobStatus::Completed => {
                tracing::info!(job_id = %self.job.id(), "Job completed");
                Ok(())
            }
            status => Err(ExecutorError::Consistency(format!(
                "job {} finished streaming while {status}",
                self.job.id()
            ))),
        }
    }
}

impl<J: PolledJob> Iterator for JobOutputs<J> {
    type Item = ExecutorResult<WorkflowOutputImage>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.span.clone();
        let _entered = span.enter();

        loop {
            if let Some(image) = self.pending.pop_front() {
                return Some(Ok(image));
            }

            // Any early return below leaves the state at `Done`.
            match std::mem::replace(&mut self.state, DriverState::Done) {
                DriverState::Done => return None,
                DriverState::Polling => {
                    if let Err(e) = self.wait_until_started() {
                        return Some(Err(e));
                    }
                    self.state = DriverState::Streaming(RecordReassembler::new(self.open_stream()));
                }
                DriverState::Streaming(mut records) => match records.next() {
                    Some(Ok(record)) => {
                        if self.is_cancelled() {
                            return Some(Err(ExecutorError::Cancelled));
                        }
                        if let Err(e) = self.accept_record(&record) {
                            return Some(Err(e));
                        }
                        self.state = DriverState::Streaming(records);
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => {
                        return self.ensure_completed().err().map(Err);
                    }
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use comfyexec_core::payload::JobInput;
    use comfyexec_core::JobGraph;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use serde_json::json;

    use super::*;

    struct ScriptedJob {
        statuses: Mutex<VecDeque<JobStatus>>,
        status_calls: Arc<Mutex<usize>>,
        chunks: Vec<String>,
        failure: Value,
    }

    impl PolledJob for ScriptedJob {
        fn id(&self) -> &str {
            "job-1"
        }

        fn status(&self) -> ExecutorResult<JobStatus> {
            *self.status_calls.lock().unwrap() += 1;
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop_front()
            } else {
                statuses.front().copied()
            };
            Ok(status.unwrap_or(JobStatus::Completed))
        }

        fn stream(&self, _cancel: &CancellationToken) -> ChunkStream {
            Box::new(self.chunks.clone().into_iter().map(Ok))
        }

        fn output(&self) -> ExecutorResult<Value> {
            Ok(self.failure.clone())
        }
    }

    /// A running job whose stream never terminates a record. The test's
    /// token is cancelled on pull number `cancel_at`.
    struct EndlessJob {
        pulls: Arc<AtomicUsize>,
        cancel_at: usize,
        token: CancellationToken,
    }

    impl PolledJob for EndlessJob {
        fn id(&self) -> &str {
            "job-endless"
        }

        fn status(&self) -> ExecutorResult<JobStatus> {
            Ok(JobStatus::Running)
        }

        fn stream(&self, _cancel: &CancellationToken) -> ChunkStream {
            let pulls = Arc::clone(&self.pulls);
            let cancel_at = self.cancel_at;
            let token = self.token.clone();
            Box::new(std::iter::from_fn(move || {
                if pulls.fetch_add(1, Ordering::SeqCst) + 1 == cancel_at {
                    token.cancel();
                }
                Some(Ok("x".to_string()))
            }))
        }

        fn output(&self) -> ExecutorResult<Value> {
            Ok(Value::Null)
        }
    }

    struct ScriptedTransport<J> {
        job: Mutex<Option<J>>,
    }

    impl<J: PolledJob> PollingTransport for ScriptedTransport<J> {
        type Job = J;

        fn submit(&self, _payload: &JobPayload) -> ExecutorResult<J> {
            Ok(self.job.lock().unwrap().take().expect("submitted twice"))
        }
    }

    fn payload() -> JobPayload {
        JobPayload {
            input: JobInput {
                workflow: JobGraph::new(json!({})),
                batch_count: 1,
                randomize_seed: false,
                images: vec![],
            },
        }
    }

    fn image_record(name: &str) -> String {
        let image = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let encoded = codec::encode_base64(&image, ImageFormat::Png).unwrap();
        json!({"images": [{"image": encoded, "name": name, "subfolder": "out"}]}).to_string()
    }

    /// Split `text` into chunks of `size` characters, so no chunk ends
    /// on a record boundary by construction.
    fn rechunk(text: &str, size: usize) -> Vec<String> {
        text.chars()
            .collect::<Vec<_>>()
            .chunks(size)
            .map(|c| c.iter().collect())
            .collect()
    }

    fn driver_for(
        statuses: &[JobStatus],
        chunks: Vec<String>,
        failure: Value,
    ) -> (BlockingJobDriver<ScriptedTransport<ScriptedJob>>, Arc<Mutex<usize>>) {
        let status_calls = Arc::new(Mutex::new(0));
        let job = ScriptedJob {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            status_calls: Arc::clone(&status_calls),
            chunks,
            failure,
        };
        let transport = ScriptedTransport {
            job: Mutex::new(Some(job)),
        };
        let driver = BlockingJobDriver::new(Arc::new(transport)).with_poll_interval(Duration::ZERO);
        (driver, status_calls)
    }

    // -- happy path --

    #[test]
    fn yields_images_from_each_record_and_stops_polling_once_running() {
        let stream = format!("{}\n{}\n", image_record("a.png"), image_record("b.png"));
        let (driver, status_calls) = driver_for(
            &[
                JobStatus::Queued,
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Completed,
            ],
            rechunk(&stream, 7),
            Value::Null,
        );

        let outputs: Vec<_> = driver
            .run(&payload(), false)
            .unwrap()
            .collect::<ExecutorResult<_>>()
            .unwrap();

        let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
        assert_eq!(outputs[0].subfolder.as_deref(), Some("out"));
        // Three polls to leave the queue plus one final check.
        assert_eq!(*status_calls.lock().unwrap(), 4);
    }

    #[test]
    fn heartbeat_records_are_skipped() {
        let stream = format!("\n{{}}\nnull\n{}\n", image_record("a.png"));
        let (driver, _) = driver_for(
            &[JobStatus::Running, JobStatus::Completed],
            rechunk(&stream, 5),
            Value::Null,
        );
        let outputs: Vec<_> = driver.run(&payload(), false).unwrap().collect();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is_ok());
    }

    // -- failures --

    #[test]
    fn failed_before_streaming_raises_workflow_error() {
        let (driver, _) = driver_for(
            &[JobStatus::Queued, JobStatus::Failed],
            vec![image_record("never.png") + "\n"],
            json!("CUDA out of memory"),
        );

        let outputs: Vec<_> = driver.run(&payload(), false).unwrap().collect();
        assert_eq!(outputs.len(), 1);
        assert_matches!(
            &outputs[0],
            Err(ExecutorError::Workflow(payload)) if payload == "CUDA out of memory"
        );
    }

    #[test]
    fn error_record_fails_iteration() {
        let stream = format!(
            "{}\n{}\n{}\n",
            image_record("a.png"),
            json!({"error": "node 7 failed"}),
            image_record("b.png"),
        );
        let (driver, _) = driver_for(
            &[JobStatus::Running, JobStatus::Completed],
            rechunk(&stream, 11),
            Value::Null,
        );

        let outputs: Vec<_> = driver.run(&payload(), false).unwrap().collect();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].is_ok());
        assert_matches!(&outputs[1], Err(ExecutorError::Workflow(_)));
    }

    #[test]
    fn error_record_is_skipped_with_ignore_errors() {
        let stream = format!(
            "{}\n{}\n{}\n",
            image_record("a.png"),
            json!({"error": "node 7 failed"}),
            image_record("b.png"),
        );
        let (driver, _) = driver_for(
            &[JobStatus::Running, JobStatus::Completed],
            rechunk(&stream, 11),
            Value::Null,
        );

        let outputs: Vec<_> = driver
            .run(&payload(), true)
            .unwrap()
            .collect::<ExecutorResult<_>>()
            .unwrap();
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn unterminated_stream_is_framing_error() {
        let (driver, _) = driver_for(
            &[JobStatus::Running, JobStatus::Completed],
            vec![image_record("a.png")],
            Value::Null,
        );
        let outputs: Vec<_> = driver.run(&payload(), false).unwrap().collect();
        assert_eq!(outputs.len(), 1);
        assert_matches!(&outputs[0], Err(ExecutorError::ProtocolFraming { .. }));
    }

    #[test]
    fn stream_ending_without_completion_is_consistency_error() {
        let stream = format!("{}\n", image_record("a.png"));
        let (driver, _) = driver_for(
            &[JobStatus::Running, JobStatus::Failed],
            vec![stream],
            Value::Null,
        );
        let outputs: Vec<_> = driver.run(&payload(), false).unwrap().collect();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].is_ok());
        assert_matches!(&outputs[1], Err(ExecutorError::Consistency(_)));
    }

    #[test]
    fn malformed_record_is_reported() {
        let (driver, _) = driver_for(
            &[JobStatus::Running, JobStatus::Completed],
            vec!["{not json\n".to_string()],
            Value::Null,
        );
        let outputs: Vec<_> = driver.run(&payload(), false).unwrap().collect();
        assert_matches!(&outputs[..], [Err(ExecutorError::MalformedRecord(_))]);
    }

    #[test]
    fn cancelled_while_queued() {
        let (driver, _) = driver_for(&[JobStatus::Queued], vec![], Value::Null);
        let token = CancellationToken::new();
        token.cancel();
        let outputs: Vec<_> = driver
            .run(&payload(), false)
            .unwrap()
            .with_cancellation(token)
            .collect();
        assert_matches!(&outputs[..], [Err(ExecutorError::Cancelled)]);
    }

    #[test]
    fn cancelled_mid_stream_stops_pulling_chunks() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let job = EndlessJob {
            pulls: Arc::clone(&pulls),
            cancel_at: 5,
            token: token.clone(),
        };
        let transport = ScriptedTransport {
            job: Mutex::new(Some(job)),
        };
        let driver = BlockingJobDriver::new(Arc::new(transport)).with_poll_interval(Duration::ZERO);

        let outputs: Vec<_> = driver
            .run(&payload(), false)
            .unwrap()
            .with_cancellation(token)
            .collect();
        assert_matches!(&outputs[..], [Err(ExecutorError::Cancelled)]);
        assert_eq!(pulls.load(Ordering::SeqCst), 5);
    }
}
