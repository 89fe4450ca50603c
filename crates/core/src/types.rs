//! Shared value types: rendered job graphs, job status, output images,
//! and batch planning.

use std::fmt;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExecutorError, ExecutorResult};

// ---------------------------------------------------------------------------
// JobGraph
// ---------------------------------------------------------------------------

/// A rendered, backend-agnostic workflow document.
///
/// Produced by [`WorkflowTemplate::render`](crate::template::WorkflowTemplate::render)
/// and owned by whoever rendered it. Per-sub-job changes such as seed
/// randomization always operate on a clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGraph(Value);

impl JobGraph {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Mutable access for crate-internal transforms on an owned copy.
    pub(crate) fn as_value_mut(&mut self) -> &mut Value {
        &mut self.0
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a backend job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkflowOutputImage
// ---------------------------------------------------------------------------

/// One generated image returned by a backend.
#[derive(Debug, Clone)]
pub struct WorkflowOutputImage {
    pub image: DynamicImage,
    /// Filename as reported by the backend.
    pub name: String,
    /// Output subfolder, when the backend reports one.
    pub subfolder: Option<String>,
    /// Index of the sub-job that produced the image, for backends that
    /// fan a request out into several batches.
    pub batch_index: Option<u32>,
}

impl WorkflowOutputImage {
    pub fn new(image: DynamicImage, name: impl Into<String>, subfolder: Option<String>) -> Self {
        Self {
            image,
            name: name.into(),
            subfolder,
            batch_index: None,
        }
    }

    /// Tag the image with the sub-job that produced it.
    pub fn with_batch_index(mut self, batch_index: u32) -> Self {
        self.batch_index = Some(batch_index);
        self
    }
}

// ---------------------------------------------------------------------------
// BatchPlan
// ---------------------------------------------------------------------------

/// How many backend batches of which size a request needs.
///
/// `batch_count` is always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: u32,
    pub batch_count: u32,
}

impl BatchPlan {
    /// Plan enough batches of `batch_size` to cover `num_samples`.
    ///
    /// `batch_count = ceil(num_samples / batch_size)`, clamped to at least 1.
    pub fn for_samples(num_samples: u32, batch_size: u32) -> ExecutorResult<Self> {
        let batch_size = validate_batch_size(batch_size)?;
        Ok(Self {
            batch_size,
            batch_count: num_samples.div_ceil(batch_size).max(1),
        })
    }

    /// Plan an explicit number of batches.
    pub fn fixed(batch_count: u32, batch_size: u32) -> ExecutorResult<Self> {
        let batch_size = validate_batch_size(batch_size)?;
        Ok(Self {
            batch_size,
            batch_count: batch_count.max(1),
        })
    }

    /// Upper bound on the number of images the plan produces.
    pub fn total_samples(&self) -> u64 {
        u64::from(self.batch_size) * u64::from(self.batch_count)
    }
}

fn validate_batch_size(batch_size: u32) -> ExecutorResult<u32> {
    if batch_size == 0 {
        return Err(ExecutorError::InvalidConfig(
            "batch_size must be at least 1".to_string(),
        ));
    }
    Ok(batch_size)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
