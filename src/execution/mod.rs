//! Tool execution gateway
//!
//! Validates a batch of model-issued tool calls against the allow-list,
//! dispatches it to the tool backend and normalizes every raw payload into
//! the canonical `ToolResult` shape. Downstream code never inspects raw
//! payload nesting.

use crate::error::OrchestrationError;
use crate::models::{ToolCall, ToolDefinition, ToolResult, DOCSTRING_TOOL, WRITE_AND_VALIDATE_TOOL};
use crate::tools::{FunctionAllowList, ToolBackend};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Validation flag locations, checked in order; the first present one wins
const SUCCESS_FLAG_PATHS: &[&[&str]] = &[
    &["valid"],
    &["success"],
    &["validation_result", "valid"],
    &["write_result", "success"],
];

/// Script source locations inside call arguments
const ARGUMENT_CONTENT_PATHS: &[&[&str]] = &[&["content"], &["script_content"], &["code"]];

/// Script source locations inside a result payload
const PAYLOAD_CONTENT_PATHS: &[&[&str]] = &[
    &["content"],
    &["result", "content"],
    &["result", "arguments", "content"],
];

/// Dispatches tool calls to the backend (fail-whole-batch on disallowed names)
pub struct ToolGateway {
    backend: Arc<dyn ToolBackend>,
    allow_list: Arc<dyn FunctionAllowList>,
    extra_allowed: Vec<String>,
}

impl ToolGateway {
    pub fn new(backend: Arc<dyn ToolBackend>, allow_list: Arc<dyn FunctionAllowList>) -> Self {
        Self {
            backend,
            allow_list,
            extra_allowed: vec![
                WRITE_AND_VALIDATE_TOOL.to_string(),
                DOCSTRING_TOOL.to_string(),
            ],
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.backend.definitions()
    }

    /// Execute a batch, returning one result per call in call order
    pub async fn execute(&self, tool_calls: &[ToolCall]) -> Result<Vec<ToolResult>> {
        let report = self.allow_list.validate(tool_calls, &self.extra_allowed);
        if !report.all_valid {
            let disallowed = report.disallowed();
            warn!(?disallowed, "Rejecting tool batch with disallowed functions");
            return Err(OrchestrationError::DisallowedFunctions(disallowed));
        }

        let start = Instant::now();
        let output = self.backend.run(tool_calls).await.map_err(|e| match e {
            OrchestrationError::ToolExecution(_) => e,
            other => OrchestrationError::ToolExecution(other.to_string()),
        })?;

        if !output.success {
            return Err(OrchestrationError::ToolExecution(
                output
                    .error
                    .unwrap_or_else(|| "tool backend reported failure".to_string()),
            ));
        }

        if output.tool_results.len() != tool_calls.len() {
            return Err(OrchestrationError::ToolExecution(format!(
                "tool backend returned {} results for {} calls",
                output.tool_results.len(),
                tool_calls.len()
            )));
        }

        let results: Vec<ToolResult> = tool_calls
            .iter()
            .zip(output.tool_results)
            .map(|(call, payload)| normalize(call, payload))
            .collect();

        debug!(
            tool_count = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            execution_time_ms = start.elapsed().as_millis() as u64,
            "Tool batch executed"
        );

        Ok(results)
    }
}

/// Convert a raw backend payload into the canonical result for `call`
pub fn normalize(call: &ToolCall, payload: Value) -> ToolResult {
    let success = payload_success(&payload);
    let script_content = first_string(&call.arguments, ARGUMENT_CONTENT_PATHS)
        .or_else(|| first_string(&payload, PAYLOAD_CONTENT_PATHS));

    ToolResult {
        tool_call_id: call.id.clone(),
        function_name: call.function_name.clone(),
        success,
        payload,
        script_content,
    }
}

fn payload_success(payload: &Value) -> bool {
    SUCCESS_FLAG_PATHS
        .iter()
        .find_map(|path| lookup(payload, path).and_then(Value::as_bool))
        .unwrap_or_else(|| payload.get("error").map_or(true, Value::is_null))
}

fn first_string(value: &Value, paths: &[&[&str]]) -> Option<String> {
    paths
        .iter()
        .filter_map(|path| lookup(value, path).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}
