//! Workflow submission across execution backends.
//!
//! [`WorkflowExecutor`] is the one contract callers use. Three backends
//! implement it:
//!
//! - [`RunPodWorkflowExecutor`] submits one job per request to a queued
//!   worker and drives it with the blocking [`driver`], bridged onto the
//!   async runtime by [`bridge`] for the async form.
//! - [`ComfyServerWorkflowExecutor`] stages inputs on a ComfyUI server
//!   and queues one prompt per batch through the [`fanout`] coordinator.
//! - [`DummyWorkflowExecutor`] returns sample images without any server.
//!
//! [`connect_executor`] builds the right one from a [`BackendConfig`].

pub mod backend;
pub mod bridge;
pub mod comfy_server;
pub mod config;
pub mod driver;
pub mod dummy;
pub mod executor;
pub mod fanout;
pub mod runpod;
pub mod transport;

pub use backend::{connect_executor, Backend};
pub use comfy_server::ComfyServerWorkflowExecutor;
pub use config::{BackendConfig, ComfyServerConfig, DummyConfig, RunPodConfig};
pub use dummy::DummyWorkflowExecutor;
pub use executor::{OutputIter, WorkflowExecutor};
pub use runpod::RunPodWorkflowExecutor;
