//! Batch fan-out for direct servers.
//!
//! A request for `num_samples` images becomes `batch_count` prompts of
//! `batch_size` each. The coordinator stages the inputs once, renders the
//! workflow once, queues every batch concurrently (each with its own copy
//! of the graph), and hands back a [`SubmittedBatches`] that yields
//! results in completion order.

use std::sync::Arc;

use comfyexec_core::payload::{new_correlation_id, template_variables, upload_image_name};
use comfyexec_core::seed::randomize_noise_seeds;
use comfyexec_core::{ExecutorResult, JobGraph, SubmitOptions, WorkflowOutputImage, WorkflowTemplate};
use futures::future::{self, BoxFuture};
use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use image::DynamicImage;
use tracing::{Instrument, Span};

use crate::transport::DirectTransport;

type BatchResult = (u32, ExecutorResult<Vec<WorkflowOutputImage>>);

/// Splits requests into concurrently queued batches.
pub struct FanOutCoordinator<T> {
    transport: Arc<T>,
    default_batch_size: u32,
    span: Span,
}

impl<T: DirectTransport> FanOutCoordinator<T> {
    pub fn new(transport: Arc<T>, default_batch_size: u32) -> Self {
        Self {
            transport,
            default_batch_size,
            span: Span::none(),
        }
    }

    pub fn with_default_batch_size(mut self, batch_size: u32) -> Self {
        self.default_batch_size = batch_size;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn default_batch_size(&self) -> u32 {
        self.default_batch_size
    }

    /// Stage `images`, render `template`, and queue every batch.
    ///
    /// Fails without queueing anything if any upload fails. A batch that
    /// cannot be queued fails the request unless `ignore_errors` is set.
    pub async fn submit(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<SubmittedBatches> {
        self.submit_inner(template, images, options)
            .instrument(self.span.clone())
            .await
    }

    async fn submit_inner(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<SubmittedBatches> {
        let correlation_id = new_correlation_id();
        let plan = options.batch_plan(self.default_batch_size)?;
        let transport = &*self.transport;

        tracing::info!(
            correlation_id = %correlation_id,
            images = images.len(),
            "Uploading input images",
        );
        let uploads = images.iter().enumerate().map(|(index, image)| {
            let subfolder = correlation_id.as_str();
            async move {
                let name = upload_image_name(index);
                transport.upload_image(&name, image, subfolder).await
            }
        });
        future::try_join_all(uploads).await?;

        let input_images_dir = format!("input/{correlation_id}");
        let graph = template.render(&template_variables(&input_images_dir, &plan, options))?;

        let enqueues = (0..plan.batch_count).map(|batch| {
            let graph = batch_graph(&graph, options.randomize_seed);
            async move { (batch, transport.enqueue_workflow(&graph).await) }
        });
        let queued = future::join_all(enqueues).await;

        let pending = FuturesUnordered::new();
        for (batch, prompt) in queued {
            match prompt {
                Ok(prompt) => {
                    tracing::debug!(
                        correlation_id = %correlation_id,
                        batch,
                        prompt_id = %prompt.prompt_id,
                        "Batch queued",
                    );
                    pending.push(
                        prompt
                            .result
                            .map(move |result| (batch, result))
                            .boxed(),
                    );
                }
                Err(e) if options.ignore_errors => {
                    tracing::warn!(correlation_id = %correlation_id, batch, error = %e, "Skipping batch that failed to queue");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            correlation_id = %correlation_id,
            batch_size = plan.batch_size,
            batches = pending.len(),
            "Workflow submitted, waiting for results",
        );

        Ok(SubmittedBatches {
            correlation_id,
            pending,
            ignore_errors: options.ignore_errors,
            span: self.span.clone(),
        })
    }
}

/// The graph for one batch: an independent copy, reseeded if requested.
fn batch_graph(graph: &JobGraph, randomize_seed: bool) -> JobGraph {
    if randomize_seed {
        randomize_noise_seeds(graph)
    } else {
        graph.clone()
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Batches queued for one request, resolved in completion order.
///
/// Every image is tagged with the index of the batch that produced it.
/// A failed batch is logged and skipped when `ignore_errors` is set;
/// otherwise it is returned and nothing further is yielded.
pub struct SubmittedBatches {
    correlation_id: String,
    pending: FuturesUnordered<BoxFuture<'static, BatchResult>>,
    ignore_errors: bool,
    span: Span,
}

impl SubmittedBatches {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Batches not yet yielded.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the next batch to finish.
    pub async fn next_batch(&mut self) -> Option<ExecutorResult<(u32, Vec<WorkflowOutputImage>)>> {
        let span = self.span.clone();
        self.next_batch_inner().instrument(span).await
    }

    async fn next_batch_inner(&mut self) -> Option<ExecutorResult<(u32, Vec<WorkflowOutputImage>)>> {
        loop {
            let (batch, result) = self.pending.next().await?;
            match result {
                Ok(images) => {
                    tracing::info!(
                        correlation_id = %self.correlation_id,
                        batch,
                        images = images.len(),
                        "Batch finished",
                    );
                    let images = images
                        .into_iter()
                        .map(|image| image.with_batch_index(batch))
                        .collect();
                    return Some(Ok((batch, images)));
                }
                Err(e) if self.ignore_errors => {
                    tracing::warn!(
                        correlation_id = %self.correlation_id,
                        batch,
                        error = %e,
                        "Skipping failed batch",
                    );
                }
                Err(e) => {
                    tracing::error!(
                        correlation_id = %self.correlation_id,
                        batch,
                        error = %e,
                        "Batch failed",
                    );
                    self.pending = FuturesUnordered::new();
                    return Some(Err(e));
                }
            }
        }
    }

    /// Yield images as their batches finish.
    pub fn into_stream(self) -> impl Stream<Item = ExecutorResult<WorkflowOutputImage>> + Send {
        stream::unfold(self, |mut batches| async move {
            let next = batches.next_batch().await?;
            Some((next, batches))
        })
        .flat_map(|next| {
            let items: Vec<ExecutorResult<WorkflowOutputImage>> = match next {
                Ok((_, images)) => images.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
    }

    /// Collect every image, failing on the first unignored batch error.
    pub async fn collect(mut self) -> ExecutorResult<Vec<WorkflowOutputImage>> {
        let mut outputs = Vec::new();
        while let Some(next) = self.next_batch().await {
            let (_, images) = next?;
            outputs.extend(images);
        }
        Ok(outputs)
    }
}

impl std::fmt::Debug for SubmittedBatches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmittedBatches")
            .field("correlation_id", &self.correlation_id)
            .field("remaining", &self.pending.len())
            .field("ignore_errors", &self.ignore_errors)
            .finish()
    }
}
