//! Per-backend settings consumed by [`crate::connect_executor`].
//!
//! Constructors take the required connection details and fill every
//! other field with its default.

use std::path::PathBuf;
use std::time::Duration;

use comfyexec_core::payload::DEFAULT_COMFYUI_BASE_DIR;
use comfyexec_runpod::endpoint::{DEFAULT_BASE_URL, DEFAULT_STREAM_POLL_INTERVAL};

use crate::backend::Backend;
use crate::driver::DEFAULT_POLL_INTERVAL;

/// Images per batch when neither the executor nor the call sets one.
pub const DEFAULT_BATCH_SIZE: u32 = 1;

/// Settings for the queued-worker backend.
#[derive(Clone)]
pub struct RunPodConfig {
    pub endpoint_id: String,
    pub api_key: String,
    /// API root, without the endpoint id.
    pub base_url: String,
    pub batch_size: u32,
    /// ComfyUI install directory on the worker; inputs are staged below
    /// `<comfyui_base_dir>/input`.
    pub comfyui_base_dir: PathBuf,
    /// Delay between status polls while the job is queued.
    pub poll_interval: Duration,
    /// Delay between result stream fetches.
    pub stream_poll_interval: Duration,
}

impl RunPodConfig {
    pub fn new(endpoint_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            comfyui_base_dir: PathBuf::from(DEFAULT_COMFYUI_BASE_DIR),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stream_poll_interval: DEFAULT_STREAM_POLL_INTERVAL,
        }
    }
}

impl std::fmt::Debug for RunPodConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPodConfig")
            .field("endpoint_id", &self.endpoint_id)
            .field("base_url", &self.base_url)
            .field("batch_size", &self.batch_size)
            .field("comfyui_base_dir", &self.comfyui_base_dir)
            .field("poll_interval", &self.poll_interval)
            .field("stream_poll_interval", &self.stream_poll_interval)
            .finish_non_exhaustive()
    }
}

/// Settings for a directly reachable ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyServerConfig {
    /// Base HTTP URL, e.g. `http://localhost:8188`.
    pub api_url: String,
    pub batch_size: u32,
}

impl ComfyServerConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Settings for the stub backend.
#[derive(Debug, Clone, Default)]
pub struct DummyConfig {
    /// Directory of sample images. `None` uses a generated placeholder.
    pub image_dir: Option<PathBuf>,
}

/// Which backend to build, with its settings.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    RunPod(RunPodConfig),
    ComfyServer(ComfyServerConfig),
    Dummy(DummyConfig),
}

impl BackendConfig {
    pub fn backend(&self) -> Backend {
        match self {
            Self::RunPod(_) => Backend::RunPod,
            Self::ComfyServer(_) => Backend::ComfyServer,
            Self::Dummy(_) => Backend::Dummy,
        }
    }
}
