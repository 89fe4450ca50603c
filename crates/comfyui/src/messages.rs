//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. Only the messages that drive a
//! prompt's lifecycle are modelled; anything else fails to parse and is
//! skipped by the listener.

use serde::Deserialize;
use serde_json::Value;

/// Lifecycle messages for queued prompts.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Server status broadcast (queue depth).
    Status(StatusData),

    /// A prompt has started executing.
    ExecutionStart(PromptRef),

    /// Some nodes were skipped because their outputs are cached.
    ExecutionCached(PromptRef),

    /// A node is executing, or the prompt finished when `node` is `None`.
    Executing(ExecutingData),

    /// Step progress from a long-running node.
    Progress(ProgressData),

    /// The prompt finished successfully (newer servers send this in
    /// addition to the final `executing` message).
    ExecutionSuccess(PromptRef),

    /// The prompt failed.
    ExecutionError(ErrorData),

    /// The prompt was interrupted on the server.
    ExecutionInterrupted(InterruptedData),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i64,
}

/// Payload of messages that only identify a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    /// Absent on the idle broadcast some servers send.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_message: String,
    pub exception_type: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl ErrorData {
    /// The failure payload handed to callers.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "prompt_id": self.prompt_id,
            "node_id": self.node_id,
            "node_type": self.node_type,
            "exception_type": self.exception_type,
            "exception_message": self.exception_message,
            "traceback": self.traceback,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Outcome of a prompt as reported over the WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptSignal {
    /// All nodes ran; outputs are in the history.
    Completed,
    /// Execution failed or was interrupted; carries the failure payload.
    Failed(Value),
}

impl ServerMessage {
    /// The terminal signal this message carries, if any, with its prompt.
    pub fn terminal_signal(&self) -> Option<(&str, PromptSignal)> {
        match self {
            Self::Executing(ExecutingData {
                node: None,
                prompt_id: Some(prompt_id),
            }) => Some((prompt_id.as_str(), PromptSignal::Completed)),
            Self::ExecutionSuccess(data) => Some((data.prompt_id.as_str(), PromptSignal::Completed)),
            Self::ExecutionError(data) => {
                Some((data.prompt_id.as_str(), PromptSignal::Failed(data.to_payload())))
            }
            Self::ExecutionInterrupted(data) => Some((
                data.prompt_id.as_str(),
                PromptSignal::Failed(serde_json::json!({
                    "prompt_id": data.prompt_id,
                    "node_id": data.node_id,
                    "exception_type": "interrupted",
                    "exception_message": "Execution was interrupted",
                })),
            )),
            _ => None,
        }
    }
}

/// Parse a ComfyUI WebSocket text message.
///
/// Returns `Err` for malformed JSON and for message types not modelled
/// here; callers should skip those.
pub fn parse_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}}}}"#;
        match parse_message(json).unwrap() {
            ServerMessage::Status(data) => assert_eq!(data.status.exec_info.queue_remaining, 3),
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn executing_node_is_not_terminal() {
        let json = r#"{"type":"executing","data":{"node":"42","prompt_id":"xyz"}}"#;
        let msg = parse_message(json).unwrap();
        assert!(msg.terminal_signal().is_none());
    }

    #[test]
    fn executing_null_node_completes_prompt() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(
            msg.terminal_signal(),
            Some(("xyz", PromptSignal::Completed))
        );
    }

    #[test]
    fn idle_executing_without_prompt_is_ignored() {
        let json = r#"{"type":"executing","data":{"node":null}}"#;
        let msg = parse_message(json).unwrap();
        assert!(msg.terminal_signal().is_none());
    }

    #[test]
    fn execution_success_completes_prompt() {
        let json = r#"{"type":"execution_success","data":{"prompt_id":"p9","timestamp":1}}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.terminal_signal(), Some(("p9", PromptSignal::Completed)));
    }

    #[test]
    fn execution_error_fails_prompt_with_payload() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"5","node_type":"KSampler","exception_message":"out of memory","exception_type":"RuntimeError","traceback":["line 1"]}}"#;
        let msg = parse_message(json).unwrap();
        match msg.terminal_signal() {
            Some(("abc", PromptSignal::Failed(payload))) => {
                assert_eq!(payload["exception_message"], "out of memory");
                assert_eq!(payload["node_type"], "KSampler");
                assert_eq!(payload["traceback"][0], "line 1");
            }
            other => panic!("Expected failure for abc, got {other:?}"),
        }
    }

    #[test]
    fn execution_interrupted_fails_prompt() {
        let json = r#"{"type":"execution_interrupted","data":{"prompt_id":"abc","node_id":"3"}}"#;
        let msg = parse_message(json).unwrap();
        assert!(matches!(
            msg.terminal_signal(),
            Some(("abc", PromptSignal::Failed(_)))
        ));
    }

    #[test]
    fn parse_progress_message() {
        let json = r#"{"type":"progress","data":{"value":5,"max":20,"prompt_id":"p"}}"#;
        match parse_message(json).unwrap() {
            ServerMessage::Progress(data) => {
                assert_eq!((data.value, data.max), (5, 20));
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        let json = r#"{"type":"crystools.monitor","data":{}}"#;
        assert!(parse_message(json).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_message("not json at all").is_err());
    }
}
