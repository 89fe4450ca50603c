//! Executor for a directly reachable ComfyUI server.

use std::sync::Arc;

use async_trait::async_trait;
use comfyexec_comfyui::ComfyUIServerClient;
use comfyexec_core::{
    ExecutorError, ExecutorResult, SubmitOptions, WorkflowOutputImage, WorkflowTemplate,
};
use image::DynamicImage;
use tokio::runtime::Handle;
use tracing::Span;

use crate::backend::Backend;
use crate::config::{ComfyServerConfig, DEFAULT_BATCH_SIZE};
use crate::executor::{executor_span, OutputIter, WorkflowExecutor};
use crate::fanout::{FanOutCoordinator, SubmittedBatches};
use crate::transport::DirectTransport;

/// Fans each request out into one prompt per batch on a ComfyUI server.
pub struct ComfyServerWorkflowExecutor<T = ComfyUIServerClient> {
    fanout: FanOutCoordinator<T>,
    /// Runtime the blocking form drives the async path on.
    runtime: Option<Handle>,
}

impl ComfyServerWorkflowExecutor<ComfyUIServerClient> {
    /// Connect to the server in `config` and build an executor for it.
    pub async fn create(config: &ComfyServerConfig) -> ExecutorResult<Self> {
        let client = ComfyUIServerClient::connect(config.api_url.clone()).await?;
        Ok(Self::new(client).with_batch_size(config.batch_size))
    }
}

impl<T: DirectTransport> ComfyServerWorkflowExecutor<T> {
    /// Wrap `transport`. When called inside a Tokio runtime, the blocking
    /// form will use that runtime.
    pub fn new(transport: T) -> Self {
        Self {
            fanout: FanOutCoordinator::new(Arc::new(transport), DEFAULT_BATCH_SIZE)
                .with_span(executor_span(Backend::ComfyServer)),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Default images per batch; a call-level `batch_size` still wins.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.fanout = self.fanout.with_default_batch_size(batch_size);
        self
    }

    /// Runtime for the blocking form. It must be a multi-threaded runtime
    /// so the connection's background tasks keep running.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.fanout = self.fanout.with_span(span);
        self
    }

    pub fn transport(&self) -> &T {
        self.fanout.transport()
    }

    /// Queue every batch and return them for incremental collection.
    pub async fn submit_batches(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<SubmittedBatches> {
        self.fanout.submit(template, images, options).await
    }
}

#[async_trait]
impl<T: DirectTransport> WorkflowExecutor for ComfyServerWorkflowExecutor<T> {
    fn backend(&self) -> Backend {
        Backend::ComfyServer
    }

    /// Runs the async form to completion on the executor's runtime.
    ///
    /// Fails with [`ExecutorError::InvalidConfig`] when called from inside
    /// an async runtime, since blocking there would stall it.
    fn submit_workflow(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<OutputIter> {
        if Handle::try_current().is_ok() {
            return Err(ExecutorError::InvalidConfig(
                "blocking submit_workflow called from inside an async runtime; \
                 use submit_workflow_async"
                    .into(),
            ));
        }
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            ExecutorError::InvalidConfig(
                "no runtime for blocking submission; build the executor inside a runtime \
                 or call with_runtime"
                    .into(),
            )
        })?;

        let outputs = runtime.block_on(self.submit_workflow_async(template, images, options))?;
        Ok(Box::new(outputs.into_iter().map(Ok)))
    }

    async fn submit_workflow_async(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<Vec<WorkflowOutputImage>> {
        self.submit_batches(template, images, options)
            .await?
            .collect()
            .await
    }
}
