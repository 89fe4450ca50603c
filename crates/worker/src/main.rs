//! `comfyexec-worker` -- runs one workflow submission from the command
//! environment and writes the resulting images to disk.
//!
//! See [`config::WorkerConfig::from_env`] for the environment variables.

mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use comfyexec_core::codec;
use comfyexec_core::{WorkflowOutputImage, WorkflowTemplate};
use comfyexec_pipeline::connect_executor;
use image::{DynamicImage, ImageFormat};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfyexec_worker=info,comfyexec_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        backend = %config.backend.backend(),
        template = %config.workflow_template.display(),
        inputs = config.input_images.len(),
        num_samples = config.num_samples,
        "Loaded worker configuration",
    );

    let template = WorkflowTemplate::from_file(&config.workflow_template).with_context(|| {
        format!("failed to load template {}", config.workflow_template.display())
    })?;
    let images = load_input_images(&config.input_images)?;
    let executor = connect_executor(&config.backend).await?;
    let options = config.submit_options();

    // Dropping the submission on interrupt cancels any blocked worker.
    let outputs = tokio::select! {
        result = executor.submit_workflow_async(&template, &images, &options) => result?,
        () = shutdown_signal() => {
            anyhow::bail!("interrupted before the workflow finished");
        }
    };

    let written = write_outputs(&config.output_dir, &outputs)?;
    tracing::info!(
        outputs = written.len(),
        dir = %config.output_dir.display(),
        "Workflow outputs written",
    );
    Ok(())
}

fn load_input_images(paths: &[PathBuf]) -> anyhow::Result<Vec<DynamicImage>> {
    paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read input image {}", path.display()))?;
            codec::decode_image(&bytes)
                .with_context(|| format!("failed to decode input image {}", path.display()))
        })
        .collect()
}

/// Write each output as PNG. Outputs of a batched run are prefixed with
/// their batch index so names from different batches cannot collide.
fn write_outputs(dir: &Path, outputs: &[WorkflowOutputImage]) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    outputs
        .iter()
        .enumerate()
        .map(|(index, output)| {
            let path = dir.join(output_file_name(index, output));
            let bytes = codec::encode_image(&output.image, ImageFormat::Png)?;
            std::fs::write(&path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::debug!(path = %path.display(), "Wrote output image");
            Ok::<_, anyhow::Error>(path)
        })
        .collect()
}

fn output_file_name(index: usize, output: &WorkflowOutputImage) -> String {
    let stem = Path::new(&output.name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| format!("output_{index}"));
    match output.batch_index {
        Some(batch) => format!("batch{batch:02}_{stem}.png"),
        None => format!("{stem}.png"),
    }
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::warn!("Received SIGINT (Ctrl-C), cancelling submission");
        }
        () = terminate => {
            tracing::warn!("Received SIGTERM, cancelling submission");
        }
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    fn output(name: &str) -> WorkflowOutputImage {
        WorkflowOutputImage::new(DynamicImage::ImageRgb8(RgbImage::new(2, 2)), name, None)
    }

    #[test]
    fn file_names_are_png_and_batch_prefixed() {
        assert_eq!(output_file_name(0, &output("ComfyUI_00001_.webp")), "ComfyUI_00001_.png");
        assert_eq!(
            output_file_name(3, &output("x.png").with_batch_index(2)),
            "batch02_x.png"
        );
        assert_eq!(output_file_name(5, &output("")), "output_5.png");
    }

    #[test]
    fn writes_outputs_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let written = write_outputs(&target, &[output("a.png"), output("b.jpg")]).unwrap();
        assert_eq!(written.len(), 2);
        assert!(target.join("a.png").is_file());
        assert!(target.join("b.png").is_file());
    }

    #[test]
    fn missing_input_image_is_reported() {
        let err = load_input_images(&[PathBuf::from("/nonexistent/input.jpg")]).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/input.jpg"));
    }
}
