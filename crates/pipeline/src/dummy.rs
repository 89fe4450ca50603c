//! Stub backend for running callers without a live server.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use comfyexec_core::codec;
use comfyexec_core::options::DEFAULT_NUM_SAMPLES;
use comfyexec_core::{
    ExecutorError, ExecutorResult, SubmitOptions, WorkflowOutputImage, WorkflowTemplate,
};
use image::{DynamicImage, RgbImage};
use rand::Rng;
use tracing::Span;

use crate::backend::Backend;
use crate::config::DummyConfig;
use crate::executor::{executor_span, OutputIter, WorkflowExecutor};

/// Side length of the generated placeholder.
pub const PLACEHOLDER_SIZE: u32 = 512;

/// Returns images drawn uniformly at random from a fixed set, ignoring
/// the template and inputs it is given.
#[derive(Debug)]
pub struct DummyWorkflowExecutor {
    images: Vec<DynamicImage>,
    span: Span,
}

impl DummyWorkflowExecutor {
    /// Sample from the images in `image_dir`, or from a single generated
    /// placeholder when `None`.
    pub fn new(image_dir: Option<&Path>) -> ExecutorResult<Self> {
        let images = match image_dir {
            Some(dir) => load_images(dir)?,
            None => vec![placeholder_image()],
        };
        Self::from_images(images)
    }

    pub fn from_config(config: &DummyConfig) -> ExecutorResult<Self> {
        Self::new(config.image_dir.as_deref())
    }

    pub fn from_images(images: Vec<DynamicImage>) -> ExecutorResult<Self> {
        if images.is_empty() {
            return Err(ExecutorError::InvalidConfig(
                "dummy executor needs at least one image".into(),
            ));
        }
        Ok(Self {
            images,
            span: executor_span(Backend::Dummy),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The set outputs are drawn from.
    pub fn images(&self) -> &[DynamicImage] {
        &self.images
    }

    fn sample(&self, options: &SubmitOptions) -> Vec<WorkflowOutputImage> {
        let count = options.num_samples.unwrap_or(DEFAULT_NUM_SAMPLES);
        let mut rng = rand::rng();
        let outputs = (0..count)
            .map(|index| {
                let image = self.images[rng.random_range(0..self.images.len())].clone();
                WorkflowOutputImage::new(image, format!("dummy_{index}.png"), None)
            })
            .collect::<Vec<_>>();

        let _entered = self.span.enter();
        tracing::debug!(samples = outputs.len(), pool = self.images.len(), "Returning dummy images");
        outputs
    }
}

#[async_trait]
impl WorkflowExecutor for DummyWorkflowExecutor {
    fn backend(&self) -> Backend {
        Backend::Dummy
    }

    fn submit_workflow(
        &self,
        _template: &WorkflowTemplate,
        _images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<OutputIter> {
        Ok(Box::new(self.sample(options).into_iter().map(Ok)))
    }

    async fn submit_workflow_async(
        &self,
        _template: &WorkflowTemplate,
        _images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<Vec<WorkflowOutputImage>> {
        Ok(self.sample(options))
    }
}

fn placeholder_image() -> DynamicImage {
    let image = RgbImage::from_fn(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, |x, y| {
        let shade = if (x / 64 + y / 64) % 2 == 0 { 200 } else { 120 };
        image::Rgb([shade, shade, shade])
    });
    DynamicImage::ImageRgb8(image)
}

/// Decode every image file in `dir`, in filename order. Files that are
/// not images are skipped.
fn load_images(dir: &Path) -> ExecutorResult<Vec<DynamicImage>> {
    let mut paths = fs::read_dir(dir)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<PathBuf>, _>>()?;
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths.into_iter().filter(|path| path.is_file()) {
        match codec::decode_image(&fs::read(&path)?) {
            Ok(image) => images.push(image),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable dummy image"),
        }
    }

    tracing::info!(dir = %dir.display(), images = images.len(), "Loaded dummy images");
    Ok(images)
}
