//! Backend selection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use comfyexec_core::{ExecutorError, ExecutorResult};

use crate::comfy_server::ComfyServerWorkflowExecutor;
use crate::config::BackendConfig;
use crate::dummy::DummyWorkflowExecutor;
use crate::executor::WorkflowExecutor;
use crate::runpod::RunPodWorkflowExecutor;

/// Available execution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Queued serverless worker, polled and streamed.
    RunPod,
    /// ComfyUI server reached over HTTP and WebSocket.
    ComfyServer,
    /// Local stub returning sample images.
    Dummy,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunPod => "runpod",
            Self::ComfyServer => "comfyui",
            Self::Dummy => "dummy",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "runpod" => Ok(Self::RunPod),
            "comfyui" | "comfy_server" | "comfy-server" => Ok(Self::ComfyServer),
            "dummy" => Ok(Self::Dummy),
            other => Err(ExecutorError::InvalidConfig(format!(
                "unknown backend '{other}' (expected runpod, comfyui or dummy)"
            ))),
        }
    }
}

/// Build the executor described by `config`.
///
/// The ComfyUI backend connects to its server here; the others do no
/// I/O until the first submission.
pub async fn connect_executor(config: &BackendConfig) -> ExecutorResult<Arc<dyn WorkflowExecutor>> {
    let executor: Arc<dyn WorkflowExecutor> = match config {
        BackendConfig::RunPod(config) => Arc::new(RunPodWorkflowExecutor::from_config(config)),
        BackendConfig::ComfyServer(config) => {
            Arc::new(ComfyServerWorkflowExecutor::create(config).await?)
        }
        BackendConfig::Dummy(config) => Arc::new(DummyWorkflowExecutor::from_config(config)?),
    };

    tracing::info!(backend = %executor.backend(), "Workflow executor ready");
    Ok(executor)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::config::DummyConfig;

    #[test]
    fn parses_backend_names() {
        assert_eq!("runpod".parse::<Backend>().unwrap(), Backend::RunPod);
        assert_eq!(" ComfyUI ".parse::<Backend>().unwrap(), Backend::ComfyServer);
        assert_eq!("comfy-server".parse::<Backend>().unwrap(), Backend::ComfyServer);
        assert_eq!("dummy".parse::<Backend>().unwrap(), Backend::Dummy);
    }

    #[test]
    fn unknown_backend_is_config_error() {
        assert_matches!("local".parse::<Backend>(), Err(ExecutorError::InvalidConfig(_)));
    }

    #[test]
    fn display_round_trips() {
        for backend in [Backend::RunPod, Backend::ComfyServer, Backend::Dummy] {
            assert_eq!(backend.to_string().parse::<Backend>().unwrap(), backend);
        }
    }

    #[tokio::test]
    async fn connects_dummy_executor() {
        let executor = connect_executor(&BackendConfig::Dummy(DummyConfig::default()))
            .await
            .unwrap();
        assert_eq!(executor.backend(), Backend::Dummy);
    }
}
