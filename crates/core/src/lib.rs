//! Backend-independent building blocks for submitting ComfyUI workflows.
//!
//! Holds the data model, the error taxonomy, workflow templates, payload
//! preparation, record framing for chunked result streams, image
//! encoding, and seed randomization. Nothing in this crate performs
//! network I/O.

pub mod codec;
pub mod error;
pub mod framing;
pub mod options;
pub mod payload;
pub mod seed;
pub mod template;
pub mod types;

pub use error::{ExecutorError, ExecutorResult};
pub use options::SubmitOptions;
pub use template::WorkflowTemplate;
pub use types::{BatchPlan, JobGraph, JobStatus, WorkflowOutputImage};
