//! Transport capabilities the orchestration layer drives.
//!
//! Each backend plugs in through one of two traits: [`PollingTransport`]
//! for queued workers whose jobs are polled and streamed from a blocking
//! thread, and [`DirectTransport`] for servers that accept uploads and
//! queue one prompt per batch.

use std::future::Future;

use comfyexec_comfyui::ComfyUIServerClient;
use comfyexec_core::payload::JobPayload;
use comfyexec_core::{ExecutorError, ExecutorResult, JobGraph, JobStatus, WorkflowOutputImage};
use comfyexec_runpod::{RunPodEndpoint, RunPodJob};
use futures::future::BoxFuture;
use futures::FutureExt;
use image::DynamicImage;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Raw text chunks of a job's result stream.
pub type ChunkStream = Box<dyn Iterator<Item = ExecutorResult<String>> + Send>;

// ---------------------------------------------------------------------------
// Polling transport
// ---------------------------------------------------------------------------

/// A submitted job on a polling backend. All calls block.
pub trait PolledJob: Send + 'static {
    /// Backend job id, for logging.
    fn id(&self) -> &str;

    fn status(&self) -> ExecutorResult<JobStatus>;

    /// Open the job's result stream. The stream stops pulling once
    /// `cancel` fires, including while it waits for the next chunk.
    fn stream(&self, cancel: &CancellationToken) -> ChunkStream;

    /// The job's failure payload.
    fn output(&self) -> ExecutorResult<Value>;
}

/// A backend that accepts one payload per job and is polled for results.
pub trait PollingTransport: Send + Sync + 'static {
    type Job: PolledJob;

    fn submit(&self, payload: &JobPayload) -> ExecutorResult<Self::Job>;
}

impl PollingTransport for RunPodEndpoint {
    type Job = RunPodJob;

    fn submit(&self, payload: &JobPayload) -> ExecutorResult<RunPodJob> {
        Ok(self.run(payload)?)
    }
}

impl PolledJob for RunPodJob {
    fn id(&self) -> &str {
        self.job_id()
    }

    fn status(&self) -> ExecutorResult<JobStatus> {
        Ok(RunPodJob::status(self)?)
    }

    fn stream(&self, cancel: &CancellationToken) -> ChunkStream {
        Box::new(
            RunPodJob::stream(self, cancel.clone()).map(|chunk| chunk.map_err(ExecutorError::from)),
        )
    }

    fn output(&self) -> ExecutorResult<Value> {
        Ok(RunPodJob::output(self)?)
    }
}

// ---------------------------------------------------------------------------
// Direct transport
// ---------------------------------------------------------------------------

/// A prompt accepted by a direct server, with a future for its outputs.
pub struct PendingPrompt {
    pub prompt_id: String,
    pub result: BoxFuture<'static, ExecutorResult<Vec<WorkflowOutputImage>>>,
}

/// A server that stages input images and queues one workflow per batch.
pub trait DirectTransport: Send + Sync + 'static {
    /// Stage `image` as `input/<subfolder>/<name>`.
    fn upload_image(
        &self,
        name: &str,
        image: &DynamicImage,
        subfolder: &str,
    ) -> impl Future<Output = ExecutorResult<()>> + Send;

    /// Queue `graph`. The returned prompt's future resolves once the
    /// server has finished it.
    fn enqueue_workflow(
        &self,
        graph: &JobGraph,
    ) -> impl Future<Output = ExecutorResult<PendingPrompt>> + Send;
}

impl DirectTransport for ComfyUIServerClient {
    async fn upload_image(
        &self,
        name: &str,
        image: &DynamicImage,
        subfolder: &str,
    ) -> ExecutorResult<()> {
        ComfyUIServerClient::upload_image(self, name, image, subfolder).await?;
        Ok(())
    }

    async fn enqueue_workflow(&self, graph: &JobGraph) -> ExecutorResult<PendingPrompt> {
        let queued = ComfyUIServerClient::enqueue_workflow(self, graph.as_value()).await?;
        let prompt_id = queued.prompt_id.clone();

        let result = async move {
            let output = queued.wait().await?;
            Ok(output
                .images
                .into_iter()
                .map(|image| WorkflowOutputImage::new(image.image, image.filename, None))
                .collect())
        }
        .boxed();

        Ok(PendingPrompt { prompt_id, result })
    }
}
