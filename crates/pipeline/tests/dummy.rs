use comfyexec_core::{ExecutorResult, SubmitOptions, WorkflowTemplate};
use comfyexec_pipeline::{Backend, DummyWorkflowExecutor, WorkflowExecutor};
use image::{DynamicImage, Rgb, RgbImage};

const TEMPLATE: &str = r#"{"1": {"inputs": {"dir": "{{ input_images_dir }}", "n": {{ batch_size }}}}}"#;

const COLOURS: [[u8; 3]; 3] = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];

/// A directory with one solid-colour PNG per entry of `COLOURS`, plus a
/// file that is not an image.
fn image_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (index, colour) in COLOURS.iter().enumerate() {
        let image = RgbImage::from_pixel(4, 4, Rgb(*colour));
        image.save(dir.path().join(format!("{index}.png"))).unwrap();
    }
    std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
    dir
}

fn colour_of(image: &DynamicImage) -> [u8; 3] {
    image.to_rgb8().get_pixel(0, 0).0
}

#[test]
fn loads_every_image_in_directory() {
    let dir = image_dir();
    let executor = DummyWorkflowExecutor::new(Some(dir.path())).unwrap();
    assert_eq!(executor.images().len(), COLOURS.len());
    assert_eq!(executor.backend(), Backend::Dummy);
}

#[test]
fn blocking_outputs_come_from_directory() {
    let dir = image_dir();
    let executor = DummyWorkflowExecutor::new(Some(dir.path())).unwrap();
    let template = WorkflowTemplate::new(TEMPLATE).unwrap();

    for num_samples in [0, 1, 7] {
        let outputs = executor
            .submit_workflow(&template, &[], &SubmitOptions::new().num_samples(num_samples))
            .unwrap()
            .collect::<ExecutorResult<Vec<_>>>()
            .unwrap();
        assert_eq!(outputs.len(), num_samples as usize);
        assert!(outputs
            .iter()
            .all(|output| COLOURS.contains(&colour_of(&output.image))));
    }
}

#[tokio::test]
async fn async_outputs_come_from_directory() {
    let dir = image_dir();
    let executor = DummyWorkflowExecutor::new(Some(dir.path())).unwrap();
    let template = WorkflowTemplate::new(TEMPLATE).unwrap();

    let outputs = executor
        .submit_workflow_async(&template, &[], &SubmitOptions::new().num_samples(5))
        .await
        .unwrap();
    assert_eq!(outputs.len(), 5);
    assert!(outputs
        .iter()
        .all(|output| COLOURS.contains(&colour_of(&output.image))));
}

#[tokio::test]
async fn placeholder_backend_ignores_inputs() {
    let executor = DummyWorkflowExecutor::new(None).unwrap();
    let template = WorkflowTemplate::new(TEMPLATE).unwrap();
    let inputs = vec![DynamicImage::ImageRgb8(RgbImage::new(2, 2))];

    let outputs = executor
        .submit_workflow_async(&template, &inputs, &SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].image.width(), 512);
}
