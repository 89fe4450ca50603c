//! Request payload preparation.
//!
//! Turns a template, input images, and [`SubmitOptions`] into the body a
//! queued-worker backend expects. No network I/O happens here.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::error::ExecutorResult;
use crate::options::SubmitOptions;
use crate::template::{TemplateVariables, WorkflowTemplate};
use crate::types::{BatchPlan, JobGraph};

/// Default ComfyUI installation root on queued workers.
pub const DEFAULT_COMFYUI_BASE_DIR: &str = "/comfyui";

/// Format input images are staged in.
pub const STAGED_IMAGE_FORMAT: ImageFormat = ImageFormat::Jpeg;

// ---------------------------------------------------------------------------
// Correlation ids and naming
// ---------------------------------------------------------------------------

/// Generate a fresh correlation id for grouping one request's inputs.
///
/// This is not a backend job id; it only namespaces the staged images.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Filename of the `index`-th input image inside a job payload.
pub fn payload_image_name(index: usize) -> String {
    format!("{index:02}.jpg")
}

/// Filename of the `index`-th input image uploaded to a ComfyUI server.
pub fn upload_image_name(index: usize) -> String {
    format!("{index:04}.jpg")
}

/// Build template variables for a render.
///
/// `template_vars` from the options are applied on top of the base
/// variables, except that `batch_size` always matches the batch plan.
pub fn template_variables(
    input_images_dir: &str,
    plan: &BatchPlan,
    options: &SubmitOptions,
) -> TemplateVariables {
    let mut variables = TemplateVariables::new();
    variables.insert("input_images_dir".into(), Value::from(input_images_dir));
    variables.extend(options.template_vars.clone());
    variables.insert("batch_size".into(), Value::from(plan.batch_size));
    variables
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Request body for a queued-worker job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub input: JobInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    pub workflow: JobGraph,
    pub batch_count: u32,
    pub randomize_seed: bool,
    pub images: Vec<StagedImage>,
}

/// An input image embedded in a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedImage {
    pub name: String,
    /// Base64-encoded JPEG.
    pub image: String,
    pub subfolder: String,
}

/// A payload plus the bookkeeping used to build it.
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub correlation_id: String,
    pub plan: BatchPlan,
    pub body: JobPayload,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds [`JobPayload`]s for one executor.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    default_batch_size: u32,
    comfyui_base_dir: PathBuf,
}

impl PayloadBuilder {
    pub fn new(default_batch_size: u32, comfyui_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_batch_size,
            comfyui_base_dir: comfyui_base_dir.into(),
        }
    }

    pub fn default_batch_size(&self) -> u32 {
        self.default_batch_size
    }

    pub fn comfyui_base_dir(&self) -> &Path {
        &self.comfyui_base_dir
    }

    /// Directory on the worker that holds one request's input images.
    pub fn input_images_dir(&self, correlation_id: &str) -> PathBuf {
        self.comfyui_base_dir.join("input").join(correlation_id)
    }

    /// Prepare a payload for `template`.
    ///
    /// Every image is JPEG-encoded under the fresh correlation id before
    /// the template is rendered.
    pub fn build(
        &self,
        template: &WorkflowTemplate,
        images: &[DynamicImage],
        options: &SubmitOptions,
    ) -> ExecutorResult<PreparedPayload> {
        let correlation_id = new_correlation_id();
        let plan = options.batch_plan(self.default_batch_size)?;

        let staged = images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                Ok(StagedImage {
                    name: payload_image_name(index),
                    image: codec::encode_base64(image, STAGED_IMAGE_FORMAT)?,
                    subfolder: correlation_id.clone(),
                })
            })
            .collect::<ExecutorResult<Vec<_>>>()?;

        let input_images_dir = self.input_images_dir(&correlation_id);
        let variables =
            template_variables(&input_images_dir.to_string_lossy(), &plan, options);
        let workflow = template.render(&variables)?;

        tracing::debug!(
            correlation_id = %correlation_id,
            batch_size = plan.batch_size,
            batch_count = plan.batch_count,
            images = staged.len(),
            "Prepared workflow payload",
        );

        Ok(PreparedPayload {
            correlation_id,
            plan,
            body: JobPayload {
                input: JobInput {
                    workflow,
                    batch_count: plan.batch_count,
                    randomize_seed: options.randomize_seed,
                    images: staged,
                },
            },
        })
    }
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new(1, DEFAULT_COMFYUI_BASE_DIR)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
