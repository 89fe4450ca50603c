//! Per-call submission options.
//!
//! Every option a backend understands is an explicit field. Anything
//! else a template needs goes into [`SubmitOptions::template_vars`].

use serde_json::{Map, Value};

use crate::error::ExecutorResult;
use crate::types::BatchPlan;

/// Samples requested when the caller does not say otherwise.
pub const DEFAULT_NUM_SAMPLES: u32 = 1;

/// Options for a single workflow submission.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Number of images wanted. When `None`, the batch count comes from
    /// [`batch_count`](Self::batch_count) instead.
    pub num_samples: Option<u32>,
    /// Give every batch a fresh noise seed.
    pub randomize_seed: bool,
    /// Skip failed records / sub-jobs instead of failing the call.
    pub ignore_errors: bool,
    /// Overrides the executor's configured batch size.
    pub batch_size: Option<u32>,
    /// Explicit batch count, used only when `num_samples` is `None`.
    pub batch_count: Option<u32>,
    /// Extra template variables. These may shadow `input_images_dir`
    /// but never `batch_size`.
    pub template_vars: Map<String, Value>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            num_samples: Some(DEFAULT_NUM_SAMPLES),
            randomize_seed: true,
            ignore_errors: false,
            batch_size: None,
            batch_count: None,
            template_vars: Map::new(),
        }
    }
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_samples(mut self, num_samples: u32) -> Self {
        self.num_samples = Some(num_samples);
        self
    }

    /// Let `batch_count` decide how many batches run.
    pub fn without_num_samples(mut self) -> Self {
        self.num_samples = None;
        self
    }

    pub fn randomize_seed(mut self, randomize_seed: bool) -> Self {
        self.randomize_seed = randomize_seed;
        self
    }

    pub fn ignore_errors(mut self, ignore_errors: bool) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn batch_count(mut self, batch_count: u32) -> Self {
        self.batch_count = Some(batch_count);
        self
    }

    /// Add a template-specific variable.
    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.template_vars.insert(name.into(), value.into());
        self
    }

    /// Resolve the batch plan against the executor's default batch size.
    ///
    /// The call-level `batch_size` wins over `default_batch_size`.
    pub fn batch_plan(&self, default_batch_size: u32) -> ExecutorResult<BatchPlan> {
        let batch_size = self.batch_size.unwrap_or(default_batch_size);
        match self.num_samples {
            Some(num_samples) => BatchPlan::for_samples(num_samples, batch_size),
            None => BatchPlan::fixed(self.batch_count.unwrap_or(1), batch_size),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
