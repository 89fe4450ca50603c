//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps image upload, prompt submission, history retrieval, and output
//! download using [`reqwest`].

use serde::Deserialize;
use serde_json::Value;

/// HTTP client for a single ComfyUI server.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    pub number: i64,
    /// Per-node validation errors. Non-empty means nothing was queued.
    #[serde(default)]
    pub node_errors: Value,
}

/// Response returned by `/upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    /// Stored filename (ComfyUI may rename on collision).
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A file reference from a prompt's history outputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `temp`, or `input`.
    #[serde(rename = "type", default = "default_image_kind")]
    pub kind: String,
}

fn default_image_kind() -> String {
    "output".to_string()
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// ComfyUI rejected the workflow during validation.
    #[error("ComfyUI rejected the workflow: {0}")]
    NodeErrors(Value),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI server.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Upload an encoded image into the server's input directory.
    ///
    /// Sends a multipart `POST /upload/image` placing the file under
    /// `input/<subfolder>/<name>`, overwriting any existing file.
    pub async fn upload_image(
        &self,
        name: &str,
        bytes: Vec<u8>,
        mime: &str,
        subfolder: &str,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("subfolder", subfolder.to_string())
            .text("type", "input")
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        if submitted
            .node_errors
            .as_object()
            .is_some_and(|errors| !errors.is_empty())
        {
            return Err(ComfyUIApiError::NodeErrors(submitted.node_errors));
        }
        Ok(submitted)
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The returned JSON is
    /// keyed by prompt id and contains the per-node outputs.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download a file referenced by a history entry.
    pub async fn view(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Collect the `output`-type images of one prompt from a `/history`
/// response, in node-id order.
///
/// Returns `None` when the history has no entry for `prompt_id` yet.
pub fn output_images(history: &Value, prompt_id: &str) -> Option<Vec<ImageRef>> {
    let entry = history.get(prompt_id)?;
    let mut images = Vec::new();

    if let Some(outputs) = entry.get("outputs").and_then(Value::as_object) {
        let mut nodes: Vec<(&String, &Value)> = outputs.iter().collect();
        nodes.sort_by(|(a, _), (b, _)| node_order(a, b));

        for (_node_id, node_output) in nodes {
            let Some(list) = node_output.get("images").and_then(Value::as_array) else {
                continue;
            };
            images.extend(
                list.iter()
                    .filter_map(|item| serde_json::from_value::<ImageRef>(item.clone()).ok())
                    .filter(|image| image.kind == "output"),
            );
        }
    }

    Some(images)
}

/// Numeric node ids sort numerically, everything else lexically after.
fn node_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
