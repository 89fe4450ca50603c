//! Executor for queued serverless workers.
//!
//! One request becomes one job: the payload carries every input image
//! and the batch count, and the worker streams images back as it
//! produces them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comfyexec_core::payload::PayloadBuilder;
use comfyexec_core::{
    ExecutorError, ExecutorResult, SubmitOptions, WorkflowOutputImage, WorkflowTemplate,
};
use comfyexec_runpod::RunPodEndpoint;
use image::DynamicImage;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::backend::Backend;
use crate::bridge::BlockingBridge;
use crate::config::RunPodConfig;
use crate::driver::BlockingJobDriver;
use crate::executor::{executor_span, OutputIter, WorkflowExecutor};
use crate::transport::PollingTransport;

pub struct RunPodWorkflowExecutor<T = RunPodEndpoint> {
    driver: BlockingJobDriver<T>,
    payloads: PayloadBuilder,
    cancel: CancellationToken,
    span: Span,
}

impl RunPodWorkflowExecutor<RunPodEndpoint> {
    /// Executor for the endpoint `endpoint_id` on the public API.
    pub fn from_endpoint_id(endpoint_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::new(RunPodEndpoint::new(endpoint_id, api_key))
    }

    pub fn from_config(config: &RunPodConfig) -> Self {
        let endpoint = RunPodEndpoint::with_options(
            config.endpoint_id.clone(),
            config.api_key.clone(),
            config.base_url.clone(),
            config.stream_poll_interval,
        );
        Self::new(endpoint)
            .with_batch_size(config.batch_size)
            .with_comfyui_base_dir(config.comfyui_base_dir.clone())
            .with_poll_interval(config.poll_interval)
    }
}

impl<T: PollingTransport> RunPodWorkflowExecutor<T> {
    pub fn new(transport: T) -> Self {
        let span = executor_span(Backend::RunPod);
        Self {
            driver: BlockingJobDriver::new(Arc::new(transport)).with_span(span.clone()),
            payloads: PayloadBuilder::default(),
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// Default images per batch; a call-level `batch_size` still wins.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.payloads = PayloadBuilder::new(batch_size, self.payloads.comfyui_base_dir());
        self
    }

    pub fn with_comfyui_base_dir(mut self, comfyui_base_dir: impl Into<PathBuf>) -> Self {
        self.payloads = PayloadBuilder::new(self.payloads.default_batch_size(), comfyui_base_dir);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.driver = self.driver.with_poll_interval(poll_interval);
        self
    }

    /// Emit this executor's events inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.driver = self.driver.with_span(span.clone());
        self.span = span;
        self
    }

    pub fn payload_builder(&self) -> &PayloadBuilder {
        &self.payloads
    }

    /// Cancelling this token stops every in-flight submission.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[async_trait]
impl<T: PollingTransport> WorkflowExecutor for RunPodWorkflowExecutor<T> {
    fn backend(&self) -> Backend {
        Backend::RunPod
    }

    /// Submits the job and returns its outputs as they stream in.
    ///
    /// Every call on the returned iterator blocks, so this fails with
    /// [`ExecutorError::InvalidConfig`] when called from inside an async
    /// runtime.
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
        let prepared = {
            let _entered = self.span.enter();
            self.payloads.build(template, images, options)?
        };
        let outputs = self
            .driver
            .run(&prepared.body, options.ignore_errors)?
            .with_cancellation(self.cancel.child_token());
        Ok(Box::new(outputs))
    }

    async fn submit_workflow_async(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<Vec<WorkflowOutputImage>> {
        let bridge = BlockingBridge::current()?.with_cancellation(self.cancel.clone());

        // The worker thread owns its own copies of the inputs.
        let template = template.clone();
        let images = images.to_vec();
        let options = options.clone();
        let payloads = self.payloads.clone();
        let driver = self.driver.clone();
        let span = self.span.clone();

        bridge
            .run(move |token| {
                let prepared = {
                    let _entered = span.enter();
                    payloads.build(&template, &images, &options)?
                };
                Ok(driver
                    .run(&prepared.body, options.ignore_errors)?
                    .with_cancellation(token))
            })
            .await
    }
}

impl<T> std::fmt::Debug for RunPodWorkflowExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPodWorkflowExecutor")
            .field("payloads", &self.payloads)
            .finish_non_exhaustive()
    }
}
