//! Gemini function-calling backend
//!
//! Maps conversation messages onto Gemini `contents` (text, `functionCall`
//! and `functionResponse` parts) and maps the reply back into text plus tool
//! calls. Uses a long-lived reqwest::Client for connection pooling.

use super::{ModelBackend, ModelRequest, ModelResponse};
use crate::models::{ContentBlock, Message, MessageContent, Role, ToolCall, ToolDefinition};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini backend (connection-pooled)
pub struct GeminiModelBackend {
    client: Client,
    api_key: String,
    base_url: String,
    temperature: f32,
    max_output_tokens: i32,
}

impl GeminiModelBackend {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(180))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            temperature: 0.2,
            max_output_tokens: 8192,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_request(&self, request: &ModelRequest<'_>) -> GeminiRequest {
        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTools {
                function_declarations: request.tools.iter().map(declaration).collect(),
            }]
        };

        GeminiRequest {
            contents: to_contents(request.messages),
            system_instruction: request.system_prompt.map(|text| SystemInstruction {
                parts: vec![Part::text(text)],
            }),
            tools,
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        }
    }
}

#[async_trait]
impl ModelBackend for GeminiModelBackend {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelResponse> {
        if self.api_key.is_empty() {
            return Ok(ModelResponse::failure("GEMINI_API_KEY not configured"));
        }

        // Gemini applies implicit prefix caching; there is nothing to opt into.
        debug!(
            model = request.model,
            message_count = request.messages.len(),
            enable_caching = request.enable_caching,
            "Calling Gemini API"
        );

        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );
        let body = self.build_request(&request);

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Gemini API request failed: {}", e);
                return Ok(ModelResponse::failure(format!("Gemini API error: {}", e)));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {} {}", status, error_text);
            return Ok(ModelResponse::failure(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Failed to parse Gemini response: {}", e);
                return Ok(ModelResponse::failure(format!("Gemini parse error: {}", e)));
            }
        };

        let mapped = from_response(gemini_response);
        info!(
            success = mapped.success,
            tool_calls = mapped.tool_calls.len(),
            "Gemini response received"
        );
        Ok(mapped)
    }
}

//
// ================= Message Mapping =================
//

fn declaration(tool: &ToolDefinition) -> FunctionDeclaration {
    FunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: tool.parameters.clone(),
    }
}

/// Consecutive messages with the same Gemini role are merged into one content.
fn to_contents(messages: &[&Message]) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::with_capacity(messages.len());

    for message in messages {
        let role = match message.role {
            Role::Assistant => "model",
            Role::User | Role::ToolResult => "user",
        };

        let mut parts = Vec::new();
        match &message.content {
            MessageContent::Text(text) if !text.is_empty() => parts.push(Part::text(text)),
            MessageContent::Text(_) => {}
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    parts.push(match block {
                        ContentBlock::Text { text } => Part::text(text),
                        ContentBlock::ToolResult(result) => Part {
                            function_response: Some(FunctionResponse {
                                name: result.function_name.clone(),
                                response: json!({
                                    "success": result.success,
                                    "result": result.payload,
                                }),
                            }),
                            ..Default::default()
                        },
                    });
                }
            }
        }

        for call in &message.tool_calls {
            parts.push(Part {
                function_call: Some(FunctionCall {
                    name: call.function_name.clone(),
                    args: call.arguments.clone(),
                }),
                ..Default::default()
            });
        }

        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(last) if last.role == role => last.parts.extend(parts),
            _ => contents.push(Content {
                role: role.to_string(),
                parts,
            }),
        }
    }

    contents
}

fn from_response(response: GeminiResponse) -> ModelResponse {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return ModelResponse::failure("No response from Gemini API");
    };

    let mut text = Vec::new();
    let mut tool_calls = Vec::new();

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(t) = part.text {
            text.push(t);
        }
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall {
                id: format!("call_{}", Uuid::new_v4().simple()),
                function_name: call.name,
                arguments: call.args,
            });
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        return ModelResponse::failure(format!(
            "Empty response from Gemini (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        ));
    }

    ModelResponse::with_tool_calls(text.join(""), tool_calls)
}

//
// ================= Wire Types =================
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTools>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}
