//! Model backend contract and implementations
//!
//! The driver talks to language models only through `ModelBackend`: it sends
//! the filtered history and receives text and/or tool-call requests.

use crate::models::{Message, ToolCall, ToolDefinition};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

pub mod gemini;
pub use gemini::GeminiModelBackend;

/// One model invocation
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub messages: &'a [&'a Message],
    pub model: &'a str,
    pub system_prompt: Option<&'a str>,
    pub enable_caching: bool,
    pub tools: &'a [ToolDefinition],
}

/// Backend reply. `success == false` carries the failure in `error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    pub success: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            success: true,
            content: content.into(),
            tool_calls,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Trait for language model backends
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelResponse>;
}

/// Replays a fixed sequence of responses and records what it was sent.
/// Keeps the orchestrator runnable without a live model.
pub struct ScriptedModelBackend {
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Snapshot of a request seen by `ScriptedModelBackend`
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tool_names: Vec<String>,
}

impl ScriptedModelBackend {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedModelBackend {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelResponse> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                model: request.model.to_string(),
                messages: request.messages.iter().map(|m| (*m).clone()).collect(),
                system_prompt: request.system_prompt.map(str::to_string),
                tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
            });

        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        Ok(next.unwrap_or_else(|| ModelResponse::failure("scripted responses exhausted")))
    }
}
