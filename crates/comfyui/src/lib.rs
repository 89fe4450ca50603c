//! Client for a self-hosted ComfyUI server.
//!
//! [`api`] wraps the HTTP endpoints, [`messages`] models the WebSocket
//! events, and [`client`] ties both together into a connection that can
//! upload inputs, queue workflows, and await their outputs.

pub mod api;
pub mod client;
pub mod messages;

pub use api::{ComfyUIApi, ComfyUIApiError};
pub use client::{ComfyUIClientError, ComfyUIServerClient, OutputImage, PromptOutput, QueuedPrompt};
