//! Tool backends and the function allow-list
//!
//! A tool backend runs a batch of named function calls and returns one raw
//! payload per call, in order. Two backends are provided: an in-process
//! registry of `Tool` trait objects and an HTTP client for the analysis
//! tool service.

use crate::error::OrchestrationError;
use crate::models::{ToolCall, ToolDefinition};
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

//
// ================= Backend Contract =================
//

/// Raw output of a tool batch, `tool_results[i]` answers `tool_calls[i]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRunOutput {
    pub success: bool,
    #[serde(default)]
    pub tool_results: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait::async_trait]
pub trait ToolBackend: Send + Sync {
    /// Declarations advertised to the model
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn run(&self, tool_calls: &[ToolCall]) -> Result<ToolRunOutput>;
}

//
// ================= In-process Registry =================
//

/// A single in-process tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, arguments: &Value) -> Result<Value>;
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ToolBackend for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Per-call failures become error payloads; the batch itself succeeds.
    async fn run(&self, tool_calls: &[ToolCall]) -> Result<ToolRunOutput> {
        let mut tool_results = Vec::with_capacity(tool_calls.len());

        for call in tool_calls {
            let payload = match self.get(&call.function_name) {
                Some(tool) => match tool.execute(&call.arguments).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(tool_name = %call.function_name, error = %e, "Tool execution failed");
                        json!({ "success": false, "error": e.to_string() })
                    }
                },
                None => {
                    warn!(tool_name = %call.function_name, "Tool not registered");
                    json!({ "success": false, "error": "Tool not registered" })
                }
            };
            tool_results.push(payload);
        }

        Ok(ToolRunOutput {
            success: true,
            tool_results,
            error: None,
        })
    }
}

//
// ================= HTTP Tool Service =================
//

/// Client for the analysis tool service
#[derive(Clone)]
pub struct HttpToolBackend {
    client: Client,
    base_url: String,
    definitions: Vec<ToolDefinition>,
}

impl HttpToolBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            definitions: Vec::new(),
        })
    }

    /// Fetch the tool declarations advertised by the service
    pub async fn load_definitions(mut self) -> Result<Self> {
        let url = format!("{}/api/v1/tools/definitions", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            OrchestrationError::ToolExecution(format!("Tool definition request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestrationError::ToolExecution(format!(
                "Tool service returned {} for definitions",
                status
            )));
        }

        self.definitions = response.json::<Vec<ToolDefinition>>().await?;
        debug!(count = self.definitions.len(), "Loaded tool definitions");
        Ok(self)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::ToolExecution(format!(
                    "Tool service request failed for {}: {}",
                    path, e
                ))
            })?;

        let status = response.status();
        let body = response.json::<Value>().await.map_err(|e| {
            OrchestrationError::ToolExecution(format!("Invalid JSON response: {}", e))
        })?;

        if !status.is_success() {
            return Err(OrchestrationError::ToolExecution(format!(
                "Tool service returned {} for {}: {}",
                status, path, body
            )));
        }

        Ok(body)
    }
}

#[async_trait::async_trait]
impl ToolBackend for HttpToolBackend {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }

    async fn run(&self, tool_calls: &[ToolCall]) -> Result<ToolRunOutput> {
        let body = self
            .post_json("/api/v1/tools/execute", &json!({ "tool_calls": tool_calls }))
            .await?;
        Ok(serde_json::from_value(body)?)
    }
}

//
// ================= Allow-list =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Allowed,
    Disallowed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionValidation {
    pub function: String,
    pub status: ValidationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowListReport {
    pub all_valid: bool,
    pub validation_results: Vec<FunctionValidation>,
}

impl AllowListReport {
    pub fn disallowed(&self) -> Vec<String> {
        self.validation_results
            .iter()
            .filter(|v| v.status == ValidationStatus::Disallowed)
            .map(|v| v.function.clone())
            .collect()
    }
}

pub trait FunctionAllowList: Send + Sync {
    fn validate(&self, tool_calls: &[ToolCall], extra_allowed: &[String]) -> AllowListReport;
}

/// Fixed set of permitted function names
#[derive(Debug, Clone, Default)]
pub struct StaticAllowList {
    allowed: HashSet<String>,
}

impl StaticAllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_definitions(definitions: &[ToolDefinition]) -> Self {
        Self::new(definitions.iter().map(|d| d.name.clone()))
    }

    pub fn extend<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed.extend(names.into_iter().map(Into::into));
    }
}

impl FunctionAllowList for StaticAllowList {
    fn validate(&self, tool_calls: &[ToolCall], extra_allowed: &[String]) -> AllowListReport {
        let validation_results: Vec<FunctionValidation> = tool_calls
            .iter()
            .map(|call| {
                let permitted = self.allowed.contains(&call.function_name)
                    || extra_allowed.iter().any(|name| *name == call.function_name);
                FunctionValidation {
                    function: call.function_name.clone(),
                    status: if permitted {
                        ValidationStatus::Allowed
                    } else {
                        ValidationStatus::Disallowed
                    },
                }
            })
            .collect();

        AllowListReport {
            all_valid: validation_results
                .iter()
                .all(|v| v.status == ValidationStatus::Allowed),
            validation_results,
        }
    }
}
