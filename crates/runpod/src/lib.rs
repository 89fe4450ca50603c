//! Blocking HTTP client for RunPod serverless endpoints.
//!
//! Covers the subset of the endpoint API a streaming ComfyUI worker
//! needs: submitting a job, polling its status, fetching its failure
//! output, and pulling its streamed output chunks.

pub mod api;
pub mod endpoint;

pub use api::RunPodError;
pub use endpoint::{JobStream, RunPodEndpoint, RunPodJob};
