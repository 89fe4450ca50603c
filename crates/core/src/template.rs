//! Jinja-templated workflow documents.
//!
//! A [`WorkflowTemplate`] holds the raw template text of a ComfyUI
//! workflow (API format) with Jinja placeholders. It is validated once at
//! construction and rendered into a [`JobGraph`] per submission.

use std::collections::BTreeSet;
use std::path::Path;

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};

use crate::error::{ExecutorError, ExecutorResult};
use crate::types::JobGraph;

/// Variables every workflow template must reference.
pub const REQUIRED_VARIABLES: &[&str] = &["input_images_dir", "batch_size"];

/// Template name used inside the Jinja environment. It has no file
/// extension so that no auto-escaping is applied to rendered values.
const TEMPLATE_NAME: &str = "workflow";

/// Variables passed to [`WorkflowTemplate::render`].
pub type TemplateVariables = Map<String, Value>;

/// An immutable, validated workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    source: String,
    variables: BTreeSet<String>,
}

impl WorkflowTemplate {
    /// Parse and validate a template from its text.
    ///
    /// Fails with [`ExecutorError::TemplateValidation`] when the template
    /// does not reference every entry in [`REQUIRED_VARIABLES`], and with
    /// [`ExecutorError::TemplateRender`] when the text is not valid Jinja.
    pub fn new(source: impl Into<String>) -> ExecutorResult<Self> {
        let source = source.into();
        let variables = {
            let env = environment(&source)?;
            let template = env
                .get_template(TEMPLATE_NAME)
                .map_err(|e| ExecutorError::TemplateRender(e.to_string()))?;
            template
                .undeclared_variables(false)
                .into_iter()
                .collect::<BTreeSet<_>>()
        };

        let missing: Vec<String> = REQUIRED_VARIABLES
            .iter()
            .filter(|name| !variables.contains(**name))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ExecutorError::TemplateValidation { missing });
        }

        Ok(Self { source, variables })
    }

    /// Read a template from disk.
    pub fn from_file(path: impl AsRef<Path>) -> ExecutorResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded workflow template");
        Self::new(source)
    }

    /// The raw template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every free variable the template references.
    pub fn variables(&self) -> &BTreeSet<String> {
        &self.variables
    }

    /// Render the template into a job graph.
    ///
    /// Undefined variables are errors, and the rendered text must parse
    /// as JSON.
    pub fn render(&self, variables: &TemplateVariables) -> ExecutorResult<JobGraph> {
        let env = environment(&self.source)?;
        let template = env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| ExecutorError::TemplateRender(e.to_string()))?;
        let rendered = template
            .render(minijinja::Value::from_serialize(variables))
            .map_err(|e| ExecutorError::TemplateRender(e.to_string()))?;

        serde_json::from_str(&rendered)
            .map(JobGraph::new)
            .map_err(|e| ExecutorError::TemplateRender(format!("rendered workflow is not JSON: {e}")))
    }
}

fn environment(source: &str) -> ExecutorResult<Environment<'_>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template(TEMPLATE_NAME, source)
        .map_err(|e| ExecutorError::TemplateRender(format!("template parse error: {e}")))?;
    Ok(env)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    const TEMPLATE: &str = r#"{
        "1": {"class_type": "LoadImagesFromDir", "inputs": {"directory": "{{ input_images_dir }}"}},
        "2": {"class_type": "EmptyLatentImage", "inputs": {"batch_size": {{ batch_size }}}}
    }"#;

    fn vars(value: Value) -> TemplateVariables {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test variables must be an object"),
        }
    }

    #[test]
    fn accepts_template_with_required_variables() {
        let template = WorkflowTemplate::new(TEMPLATE).unwrap();
        assert!(template.variables().contains("input_images_dir"));
        assert!(template.variables().contains("batch_size"));
    }

    #[test]
    fn rejects_template_missing_batch_size() {
        let result = WorkflowTemplate::new(r#"{"dir": "{{ input_images_dir }}"}"#);
        assert_matches!(
            result,
            Err(ExecutorError::TemplateValidation { missing }) if missing == vec!["batch_size".to_string()]
        );
    }

    #[test]
    fn rejects_template_without_variables() {
        let result = WorkflowTemplate::new(r#"{"static": true}"#);
        assert_matches!(
            result,
            Err(ExecutorError::TemplateValidation { missing }) if missing.len() == 2
        );
    }

    #[test]
    fn rejects_invalid_jinja() {
        let result = WorkflowTemplate::new("{{ input_images_dir }} {{ batch_size");
        assert_matches!(result, Err(ExecutorError::TemplateRender(_)));
    }

    #[test]
    fn renders_json_graph() {
        let template = WorkflowTemplate::new(TEMPLATE).unwrap();
        let graph = template
            .render(&vars(json!({"input_images_dir": "/comfyui/input/abc", "batch_size": 4})))
            .unwrap();
        let value = graph.as_value();
        assert_eq!(value["1"]["inputs"]["directory"], "/comfyui/input/abc");
        assert_eq!(value["2"]["inputs"]["batch_size"], 4);
    }

    #[test]
    fn render_is_deterministic() {
        let template = WorkflowTemplate::new(TEMPLATE).unwrap();
        let variables = vars(json!({"input_images_dir": "x", "batch_size": 2, "width": 768}));
        assert_eq!(
            template.render(&variables).unwrap(),
            template.render(&variables).unwrap()
        );
    }

    #[test]
    fn render_fails_on_missing_variable() {
        let template = WorkflowTemplate::new(TEMPLATE).unwrap();
        let result = template.render(&vars(json!({"input_images_dir": "x"})));
        assert_matches!(result, Err(ExecutorError::TemplateRender(_)));
    }

    #[test]
    fn render_fails_on_non_json_output() {
        let template =
            WorkflowTemplate::new("dir={{ input_images_dir }} size={{ batch_size }}").unwrap();
        let result = template.render(&vars(json!({"input_images_dir": "x", "batch_size": 1})));
        assert_matches!(result, Err(ExecutorError::TemplateRender(msg)) if msg.contains("not JSON"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("workflow.json.j2");
        std::fs::write(&path, TEMPLATE).expect("write template");
        let template = WorkflowTemplate::from_file(&path).unwrap();
        assert_eq!(template.source(), TEMPLATE);
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = WorkflowTemplate::from_file("/definitely/not/here.json");
        assert_matches!(result, Err(ExecutorError::Io(_)));
    }
}
