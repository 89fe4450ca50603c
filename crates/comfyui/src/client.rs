//! WebSocket-backed client for a single ComfyUI server.
//!
//! [`ComfyUIServerClient::connect`] opens a WebSocket with a fresh
//! `client_id` and spawns a listener task. Every workflow queued through
//! the client is registered with the listener, and the returned
//! [`QueuedPrompt`] resolves once the server reports the prompt finished
//! (outputs are then fetched over HTTP) or failed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use comfyexec_core::codec;
use comfyexec_core::payload::STAGED_IMAGE_FORMAT;
use comfyexec_core::ExecutorError;
use futures::StreamExt;
use image::DynamicImage;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::api::{output_images, ComfyUIApi, ComfyUIApiError, UploadResponse};
use crate::messages::{parse_message, PromptSignal, ServerMessage};

type ServerSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Errors that can occur when working with a connected server.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server sent something the client could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    /// The prompt ran and failed on the server.
    #[error("Execution failed: {0}")]
    Execution(Value),

    /// An input or output image could not be (de)serialized.
    #[error("Image error: {0}")]
    Image(String),

    /// The WebSocket closed before the prompt finished.
    #[error("Connection closed before the prompt finished")]
    Disconnected,
}

impl From<ComfyUIClientError> for ExecutorError {
    fn from(err: ComfyUIClientError) -> Self {
        match err {
            ComfyUIClientError::Execution(payload)
            | ComfyUIClientError::Api(ComfyUIApiError::NodeErrors(payload)) => {
                ExecutorError::Workflow(payload)
            }
            ComfyUIClientError::Image(msg) => ExecutorError::ImageCodec(msg),
            other => ExecutorError::Transport(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt registry
// ---------------------------------------------------------------------------

/// How many settled and parked prompt ids the registry remembers.
const RECENT_PROMPT_CAPACITY: usize = 1024;

/// Hands terminal signals from the listener to waiting prompts.
///
/// A signal may arrive before the prompt is registered (fast or cached
/// prompts), so unclaimed signals are parked until registration. Only
/// the first signal per prompt is delivered. Delivered ids and parked
/// signals are kept for the most recent [`RECENT_PROMPT_CAPACITY`]
/// prompts only.
#[derive(Default)]
struct PromptRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    waiting: HashMap<String, oneshot::Sender<PromptSignal>>,
    parked: RecentMap<PromptSignal>,
    delivered: RecentMap<()>,
    closed: bool,
}

/// Insertion-ordered map that evicts its oldest entries past capacity.
struct RecentMap<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<V> Default for RecentMap<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: RECENT_PROMPT_CAPACITY,
        }
    }
}

impl<V> RecentMap<V> {
    fn insert(&mut self, key: String, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl PromptRegistry {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, prompt_id: &str) -> oneshot::Receiver<PromptSignal> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(signal) = state.parked.remove(prompt_id) {
            state.delivered.insert(prompt_id.to_string(), ());
            let _ = tx.send(signal);
        } else if !state.closed {
            state.waiting.insert(prompt_id.to_string(), tx);
        }
        // When closed, `tx` is dropped here and the receiver reports
        // the disconnect.
        rx
    }

    fn settle(&self, prompt_id: &str, signal: PromptSignal) {
        let mut state = self.lock();
        if state.delivered.contains(prompt_id) || state.parked.contains(prompt_id) {
            return;
        }
        match state.waiting.remove(prompt_id) {
            Some(tx) => {
                state.delivered.insert(prompt_id.to_string(), ());
                let _ = tx.send(signal);
            }
            None => {
                state.parked.insert(prompt_id.to_string(), signal);
            }
        }
    }

    /// Fail every waiting prompt and refuse new registrations.
    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiting.clear();
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A live connection to one ComfyUI server.
///
/// Dropping the client stops its listener; prompts still waiting then
/// resolve with [`ComfyUIClientError::Disconnected`].
pub struct ComfyUIServerClient {
    api: ComfyUIApi,
    client_id: String,
    registry: Arc<PromptRegistry>,
    cancel: CancellationToken,
}

impl ComfyUIServerClient {
    /// Connect to the server at `api_url` (e.g. `http://host:8188`).
    pub async fn connect(api_url: impl Into<String>) -> Result<Self, ComfyUIClientError> {
        Self::connect_with_client(reqwest::Client::new(), api_url).await
    }

    /// Connect reusing an existing [`reqwest::Client`].
    ///
    /// Generates a unique `client_id` (UUID v4) and passes it to the
    /// WebSocket endpoint so the server addresses prompt events to this
    /// client.
    pub async fn connect_with_client(
        http: reqwest::Client,
        api_url: impl Into<String>,
    ) -> Result<Self, ComfyUIClientError> {
        let api = ComfyUIApi::with_client(http, api_url);
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/ws?clientId={}", websocket_url(api.api_url()), client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                api.api_url()
            ))
        })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            api.api_url(),
        );

        let registry = Arc::new(PromptRegistry::default());
        let cancel = CancellationToken::new();
        tokio::spawn(listen(
            ws_stream,
            Arc::clone(&registry),
            cancel.clone(),
            client_id.clone(),
        ));

        Ok(Self {
            api,
            client_id,
            registry,
            cancel,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Upload `image` as JPEG to `input/<subfolder>/<name>`.
    pub async fn upload_image(
        &self,
        name: &str,
        image: &DynamicImage,
        subfolder: &str,
    ) -> Result<UploadResponse, ComfyUIClientError> {
        let bytes = codec::encode_image(image, STAGED_IMAGE_FORMAT)
            .map_err(|e| ComfyUIClientError::Image(e.to_string()))?;
        let uploaded = self
            .api
            .upload_image(name, bytes, "image/jpeg", subfolder)
            .await?;
        tracing::debug!(name = %uploaded.name, subfolder = %uploaded.subfolder, "Uploaded input image");
        Ok(uploaded)
    }

    /// Queue `workflow` and register for its completion.
    pub async fn enqueue_workflow(
        &self,
        workflow: &Value,
    ) -> Result<QueuedPrompt, ComfyUIClientError> {
        let submitted = self.api.submit_workflow(workflow, &self.client_id).await?;
        let signal = self.registry.register(&submitted.prompt_id);

        tracing::info!(
            client_id = %self.client_id,
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            "Workflow queued on ComfyUI",
        );

        Ok(QueuedPrompt {
            prompt_id: submitted.prompt_id,
            number: submitted.number,
            api: self.api.clone(),
            signal,
        })
    }

    /// Stop the listener task.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ComfyUIServerClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A queued prompt awaiting its result.
pub struct QueuedPrompt {
    pub prompt_id: String,
    /// Queue position reported at submission.
    pub number: i64,
    api: ComfyUIApi,
    signal: oneshot::Receiver<PromptSignal>,
}

/// A decoded output image of a finished prompt.
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub image: DynamicImage,
    pub filename: String,
    pub subfolder: String,
}

/// Every output image of a finished prompt, in node order.
#[derive(Debug, Clone)]
pub struct PromptOutput {
    pub prompt_id: String,
    pub images: Vec<OutputImage>,
}

impl QueuedPrompt {
    /// Wait for the prompt to finish and download its outputs.
    pub async fn wait(self) -> Result<PromptOutput, ComfyUIClientError> {
        let signal = self
            .signal
            .await
            .map_err(|_| ComfyUIClientError::Disconnected)?;

        match signal {
            PromptSignal::Completed => fetch_outputs(&self.api, &self.prompt_id).await,
            PromptSignal::Failed(payload) => Err(ComfyUIClientError::Execution(payload)),
        }
    }
}

async fn fetch_outputs(
    api: &ComfyUIApi,
    prompt_id: &str,
) -> Result<PromptOutput, ComfyUIClientError> {
    let history = api.get_history(prompt_id).await?;
    let refs = output_images(&history, prompt_id).ok_or_else(|| {
        ComfyUIClientError::Protocol(format!("no history entry for prompt {prompt_id}"))
    })?;

    let downloads = refs.into_iter().map(|image_ref| async move {
        let bytes = api.view(&image_ref).await?;
        let image = codec::decode_image(&bytes)
            .map_err(|e| ComfyUIClientError::Image(format!("{}: {e}", image_ref.filename)))?;
        Ok::<_, ComfyUIClientError>(OutputImage {
            image,
            filename: image_ref.filename,
            subfolder: image_ref.subfolder,
        })
    });
    let images = futures::future::try_join_all(downloads).await?;

    tracing::debug!(prompt_id, images = images.len(), "Fetched prompt outputs");

    Ok(PromptOutput {
        prompt_id: prompt_id.to_string(),
        images,
    })
}

/// `http(s)://` -> `ws(s)://`.
fn websocket_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Read frames until the socket closes or `cancel` fires, settling
/// prompts as their terminal messages arrive.
async fn listen(
    mut ws_stream: ServerSocket,
    registry: Arc<PromptRegistry>,
    cancel: CancellationToken,
    client_id: String,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_text_message(&text, &registry),
            Some(Ok(Message::Binary(_))) => {
                // Binary frames carry live previews.
                tracing::trace!(client_id = %client_id, "Ignoring binary preview frame");
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(client_id = %client_id, ?frame, "ComfyUI WebSocket closed");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!(client_id = %client_id, error = %e, "WebSocket receive error");
                break;
            }
            None => break,
        }
    }

    registry.close();
    tracing::debug!(client_id = %client_id, "ComfyUI listener stopped");
}

fn handle_text_message(text: &str, registry: &PromptRegistry) {
    let message = match parse_message(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::trace!(error = %e, "Skipping unrecognised ComfyUI message");
            return;
        }
    };

    match &message {
        ServerMessage::Progress(data) => {
            tracing::debug!(
                prompt_id = data.prompt_id.as_deref().unwrap_or(""),
                value = data.value,
                max = data.max,
                "Generation progress",
            );
        }
        ServerMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
        _ => {}
    }

    if let Some((prompt_id, signal)) = message.terminal_signal() {
        if let PromptSignal::Failed(payload) = &signal {
            tracing::warn!(prompt_id, error = %payload, "Prompt failed on ComfyUI");
        } else {
            tracing::info!(prompt_id, "Prompt finished on ComfyUI");
        }
        registry.settle(prompt_id, signal);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn queued(registry: &PromptRegistry, prompt_id: &str) -> QueuedPrompt {
        QueuedPrompt {
            prompt_id: prompt_id.to_string(),
            number: 0,
            api: ComfyUIApi::new("http://127.0.0.1:9"),
            signal: registry.register(prompt_id),
        }
    }

    #[tokio::test]
    async fn signal_after_registration_is_delivered() {
        let registry = PromptRegistry::default();
        let mut rx = registry.register("p1");
        registry.settle("p1", PromptSignal::Failed(json!("boom")));
        assert_eq!(rx.try_recv().unwrap(), PromptSignal::Failed(json!("boom")));
    }

    #[tokio::test]
    async fn signal_before_registration_is_parked() {
        let registry = PromptRegistry::default();
        registry.settle("p1", PromptSignal::Completed);
        let mut rx = registry.register("p1");
        assert_eq!(rx.try_recv().unwrap(), PromptSignal::Completed);
    }

    #[tokio::test]
    async fn only_first_signal_counts() {
        let registry = PromptRegistry::default();
        let mut rx = registry.register("p1");
        registry.settle("p1", PromptSignal::Failed(json!("first")));
        registry.settle("p1", PromptSignal::Completed);
        assert_eq!(rx.try_recv().unwrap(), PromptSignal::Failed(json!("first")));
        assert_eq!(registry.lock().parked.len(), 0);
    }

    #[test]
    fn registry_forgets_old_prompts() {
        let registry = PromptRegistry::default();
        let rounds = RECENT_PROMPT_CAPACITY * 3;
        for i in 0..rounds {
            let id = format!("p{i}");
            drop(registry.register(&id));
            registry.settle(&id, PromptSignal::Completed);
            registry.settle(&format!("orphan{i}"), PromptSignal::Completed);
        }

        let last = format!("p{}", rounds - 1);
        registry.settle(&last, PromptSignal::Failed(json!("late duplicate")));

        let state = registry.lock();
        assert!(state.waiting.is_empty());
        assert_eq!(state.delivered.len(), RECENT_PROMPT_CAPACITY);
        assert_eq!(state.parked.len(), RECENT_PROMPT_CAPACITY);
        assert!(state.delivered.contains(&last));
        assert!(!state.delivered.contains("p0"));
        assert!(!state.parked.contains(&last));
        assert!(state.parked.contains(&format!("orphan{}", rounds - 1)));
    }

    #[tokio::test]
    async fn failed_prompt_resolves_with_execution_error() {
        let registry = PromptRegistry::default();
        let prompt = queued(&registry, "p1");
        handle_text_message(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"3","exception_message":"oom","exception_type":"RuntimeError"}}"#,
            &registry,
        );
        let result = prompt.wait().await;
        assert_matches!(result, Err(ComfyUIClientError::Execution(payload)) if payload["exception_message"] == "oom");
    }

    #[tokio::test]
    async fn closing_registry_disconnects_waiters() {
        let registry = PromptRegistry::default();
        let prompt = queued(&registry, "p1");
        registry.close();
        assert_matches!(prompt.wait().await, Err(ComfyUIClientError::Disconnected));

        let late = queued(&registry, "p2");
        assert_matches!(late.wait().await, Err(ComfyUIClientError::Disconnected));
    }

    #[test]
    fn messages_for_other_prompts_do_not_resolve() {
        let registry = PromptRegistry::default();
        let mut rx = registry.register("mine");
        handle_text_message(
            r#"{"type":"executing","data":{"node":null,"prompt_id":"theirs"}}"#,
            &registry,
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn websocket_url_swaps_scheme() {
        assert_eq!(websocket_url("http://host:8188"), "ws://host:8188");
        assert_eq!(websocket_url("https://host"), "wss://host");
    }

    #[test]
    fn execution_errors_map_to_workflow_errors() {
        let err: ExecutorError = ComfyUIClientError::Execution(json!({"x": 1})).into();
        assert_matches!(err, ExecutorError::Workflow(_));
        let err: ExecutorError = ComfyUIClientError::Disconnected.into();
        assert_matches!(err, ExecutorError::Transport(_));
    }
}
