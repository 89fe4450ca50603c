use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use comfyexec_core::SubmitOptions;
use comfyexec_pipeline::config::DEFAULT_BATCH_SIZE;
use comfyexec_pipeline::{
    Backend, BackendConfig, ComfyServerConfig, DummyConfig, RunPodConfig,
};

/// One submission, configured from the environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub backend: BackendConfig,
    /// Path of the workflow template.
    pub workflow_template: PathBuf,
    pub input_images: Vec<PathBuf>,
    pub num_samples: u32,
    pub ignore_errors: bool,
    /// Directory outputs are written to.
    pub output_dir: PathBuf,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var              | Default                 |
    /// |----------------------|-------------------------|
    /// | `COMFYEXEC_BACKEND`  | `dummy`                 |
    /// | `RUNPOD_ENDPOINT_ID` | required for `runpod`   |
    /// | `RUNPOD_API_KEY`     | required for `runpod`   |
    /// | `RUNPOD_BASE_URL`    | public API              |
    /// | `RUNPOD_POLL_SECS`   | `1`                     |
    /// | `COMFYUI_URL`        | `http://127.0.0.1:8188` |
    /// | `DUMMY_IMAGE_DIR`    | generated placeholder   |
    /// | `BATCH_SIZE`         | `1`                     |
    /// | `WORKFLOW_TEMPLATE`  | required                |
    /// | `INPUT_IMAGES`       | none (comma-separated)  |
    /// | `NUM_SAMPLES`        | `1`                     |
    /// | `OUTPUT_DIR`         | `output`                |
    /// | `IGNORE_ERRORS`      | `false`                 |
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let batch_size: u32 = match var("BATCH_SIZE") {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("BATCH_SIZE must be a positive integer, got '{value}'"))?,
            None => DEFAULT_BATCH_SIZE,
        };
        if batch_size == 0 {
            bail!("BATCH_SIZE must be at least 1");
        }

        let backend: Backend = var("COMFYEXEC_BACKEND")
            .unwrap_or_else(|| "dummy".into())
            .parse()?;

        let backend = match backend {
            Backend::RunPod => {
                let endpoint_id = var("RUNPOD_ENDPOINT_ID")
                    .context("RUNPOD_ENDPOINT_ID is required for the runpod backend")?;
                let api_key = var("RUNPOD_API_KEY")
                    .context("RUNPOD_API_KEY is required for the runpod backend")?;
                let mut config = RunPodConfig::new(endpoint_id, api_key);
                if let Some(base_url) = var("RUNPOD_BASE_URL") {
                    config.base_url = base_url;
                }
                if let Some(secs) = var("RUNPOD_POLL_SECS") {
                    let secs: u64 = secs
                        .trim()
                        .parse()
                        .with_context(|| format!("RUNPOD_POLL_SECS must be an integer, got '{secs}'"))?;
                    config.poll_interval = Duration::from_secs(secs);
                }
                config.batch_size = batch_size;
                BackendConfig::RunPod(config)
            }
            Backend::ComfyServer => {
                let mut config = ComfyServerConfig::new(
                    var("COMFYUI_URL").unwrap_or_else(|| "http://127.0.0.1:8188".into()),
                );
                config.batch_size = batch_size;
                BackendConfig::ComfyServer(config)
            }
            Backend::Dummy => BackendConfig::Dummy(DummyConfig {
                image_dir: var("DUMMY_IMAGE_DIR").map(PathBuf::from),
            }),
        };

        let workflow_template = var("WORKFLOW_TEMPLATE")
            .map(PathBuf::from)
            .context("WORKFLOW_TEMPLATE must point at a workflow template")?;

        let input_images = var("INPUT_IMAGES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|path| !path.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let num_samples = match var("NUM_SAMPLES") {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("NUM_SAMPLES must be an integer, got '{value}'"))?,
            None => 1,
        };

        let ignore_errors = match var("IGNORE_ERRORS") {
            Some(value) => parse_flag(&value)
                .with_context(|| format!("IGNORE_ERRORS must be true or false, got '{value}'"))?,
            None => false,
        };

        Ok(Self {
            backend,
            workflow_template,
            input_images,
            num_samples,
            ignore_errors,
            output_dir: var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("output")),
        })
    }

    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions::new()
            .num_samples(self.num_samples)
            .ignore_errors(self.ignore_errors)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
