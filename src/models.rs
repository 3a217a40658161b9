//! Core data models for the analysis script orchestrator

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Tool that submits generated script source for validation.
pub const WRITE_AND_VALIDATE_TOOL: &str = "write_and_validate";

/// Tool that fetches documentation for an available indicator function.
pub const DOCSTRING_TOOL: &str = "get_function_docstring";

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolResult(ToolResult),
}

/// A single conversation message. Ordering is significant and append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls,
        }
    }

    /// One result message per tool-calling turn, one block per call.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::ToolResult,
            content: MessageContent::Blocks(
                results.into_iter().map(ContentBlock::ToolResult).collect(),
            ),
            tool_calls: Vec::new(),
        }
    }

    /// Concatenated text content; tool result blocks are skipped.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ToolResult(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }

    pub fn calls_function(&self, function_name: &str) -> bool {
        self.tool_calls
            .iter()
            .any(|call| call.function_name == function_name)
    }

    pub fn tool_result_blocks(&self) -> impl Iterator<Item = &ToolResult> {
        let blocks: &[ContentBlock] = match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        };
        blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolResult(result) => Some(result),
            ContentBlock::Text { .. } => None,
        })
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments: Value,
}

/// Canonical tool result, normalized at the execution gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub function_name: String,
    pub success: bool,
    pub payload: Value,
    /// Submitted script source, when the call carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

//
// ================= Verification =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelVerdict {
    pub model: String,
    pub verdict: Verdict,
    pub confidence: f32,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub critical_issues: Vec<String>,
    /// Set when the reviewing backend itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub verified: bool,
    pub per_model: Vec<ModelVerdict>,
    pub elapsed_ms: u64,
}

impl VerificationResult {
    pub fn approving_models(&self) -> Vec<&str> {
        self.per_model
            .iter()
            .filter(|v| v.verdict == Verdict::Approve && v.error.is_none())
            .map(|v| v.model.as_str())
            .collect()
    }

    /// Critical issues across all reviewers, first occurrence order.
    pub fn critical_issues(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for issue in self.per_model.iter().flat_map(|v| v.critical_issues.iter()) {
            if !seen.contains(&issue.as_str()) {
                seen.push(issue);
            }
        }
        seen
    }
}

//
// ================= Structured Responses =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReuseDecision {
    pub should_reuse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptGeneration {
    pub status: GenerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<Value>,
    /// Marks responses synthesized from a bare script block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StructuredResponse {
    ReuseDecision(ReuseDecision),
    ScriptGenerationSuccess(ScriptGeneration),
    ScriptGenerationFailed(ScriptGeneration),
    NoStructuredResponse,
}

impl StructuredResponse {
    pub fn is_match(&self) -> bool {
        !matches!(self, StructuredResponse::NoStructuredResponse)
    }
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    ReuseDecision,
    ScriptGeneration,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ModelCall,
    ToolExecution,
    NoStructuredResponse,
    ScriptGenerationFailed,
    TurnLimitExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Terminal value of one conversation, success or soft failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub response_type: ResponseType,
    pub success: bool,
    pub structured: StructuredResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ConversationFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub turns: u32,
    pub failed_validations: u32,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseType::ReuseDecision => "reuse_decision",
            ResponseType::ScriptGeneration => "script_generation",
            ResponseType::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::ModelCall => "model_call",
            FailureKind::ToolExecution => "tool_execution",
            FailureKind::NoStructuredResponse => "no_structured_response",
            FailureKind::ScriptGenerationFailed => "script_generation_failed",
            FailureKind::TurnLimitExceeded => "turn_limit_exceeded",
        };
        write!(f, "{}", s)
    }
}
