use async_trait::async_trait;
use comfyexec_core::{ExecutorResult, SubmitOptions, WorkflowOutputImage, WorkflowTemplate};
use image::DynamicImage;
use tracing::Span;

use crate::backend::Backend;

/// Blocking sequence of outputs. The first error ends it.
pub type OutputIter = Box<dyn Iterator<Item = ExecutorResult<WorkflowOutputImage>> + Send>;

/// Submits workflows to one backend.
///
/// Every backend offers a blocking form and an async form with the same
/// semantics. Callers hold executors as `Arc<dyn WorkflowExecutor>` and
/// never need to know which backend they talk to.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    fn backend(&self) -> Backend;

    /// Submit and return outputs as they become available. Blocks the
    /// calling thread.
    fn submit_workflow(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<OutputIter>;

    /// Submit and wait for every output without blocking the runtime.
    async fn submit_workflow_async(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<Vec<WorkflowOutputImage>>;
}

/// Default span for an executor's events.
pub(crate) fn executor_span(backend: Backend) -> Span {
    tracing::info_span!("executor", backend = %backend)
}
