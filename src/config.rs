//! Environment configuration
//!
//! Read once at startup (after `dotenv`); prompt files are loaded here so
//! components receive ready templates.

use crate::agent::{Orchestrator, DEFAULT_MAX_TURNS};
use crate::audit::AuditLog;
use crate::error::OrchestrationError;
use crate::execution::ToolGateway;
use crate::llm::{GeminiModelBackend, ModelBackend};
use crate::memory::ContextManager;
use crate::prompts::{PromptTemplate, DEFAULT_SYSTEM_PROMPT};
use crate::tools::{HttpToolBackend, StaticAllowList, ToolBackend};
use crate::verification::{ConsensusVerifier, Reviewer, VerificationAdjudicator};
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_VERIFICATION_MODELS: &[&str] = &["gemini-2.0-flash", "gemini-1.5-pro"];
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub gemini_api_key: String,
    pub model: String,
    pub verification_models: Vec<String>,
    pub tools_api_base_url: Option<String>,
    pub allowed_functions: Vec<String>,
    pub verification_prompt_path: Option<PathBuf>,
    pub system_prompt_path: Option<PathBuf>,
    pub max_turns: u32,
    pub enable_caching: bool,
    pub api_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            verification_models: DEFAULT_VERIFICATION_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            tools_api_base_url: None,
            allowed_functions: Vec::new(),
            verification_prompt_path: None,
            system_prompt_path: None,
            max_turns: DEFAULT_MAX_TURNS,
            enable_caching: true,
            api_port: DEFAULT_PORT,
        }
    }
}

impl OrchestratorConfig {
    /// Build from process environment. Call `dotenv::dotenv().ok()` first.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let verification_models = non_empty("VERIFICATION_MODELS")
            .map(|v| split_list(&v))
            .unwrap_or(defaults.verification_models);

        Ok(Self {
            gemini_api_key: non_empty("GEMINI_API_KEY").unwrap_or_default(),
            model: non_empty("ORCHESTRATOR_MODEL").unwrap_or(defaults.model),
            verification_models,
            tools_api_base_url: non_empty("TOOLS_API_BASE_URL"),
            allowed_functions: non_empty("ALLOWED_FUNCTIONS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            verification_prompt_path: non_empty("VERIFICATION_PROMPT_PATH").map(PathBuf::from),
            system_prompt_path: non_empty("SYSTEM_PROMPT_PATH").map(PathBuf::from),
            max_turns: parse_var("MAX_TURNS", non_empty("MAX_TURNS"))?
                .unwrap_or(defaults.max_turns),
            enable_caching: parse_var("ENABLE_PROMPT_CACHING", non_empty("ENABLE_PROMPT_CACHING"))?
                .unwrap_or(defaults.enable_caching),
            api_port: parse_var("PORT", non_empty("PORT").or_else(|| non_empty("API_PORT")))?
                .unwrap_or(defaults.api_port),
        })
    }

    /// Verification template from file, or the built-in one
    pub fn load_verification_prompt(&self) -> Result<PromptTemplate> {
        match &self.verification_prompt_path {
            Some(path) => PromptTemplate::from_file(path, &["question", "script"]),
            None => Ok(PromptTemplate::default_verification()),
        }
    }

    /// System prompt text from file, or the built-in one
    pub fn load_system_prompt(&self) -> Result<String> {
        match &self.system_prompt_path {
            Some(path) => Ok(PromptTemplate::from_file(path, &[])?.as_str().to_string()),
            None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

/// Wire the production orchestrator: Gemini for the conversation and the
/// reviewers, the HTTP tool service for execution.
pub async fn build_orchestrator(
    config: &OrchestratorConfig,
    audit_log: Arc<AuditLog>,
) -> Result<Orchestrator> {
    if config.gemini_api_key.is_empty() {
        warn!("GEMINI_API_KEY not set; model calls will fail");
    }

    let base_url = config.tools_api_base_url.as_deref().ok_or_else(|| {
        OrchestrationError::Config("TOOLS_API_BASE_URL is not configured".to_string())
    })?;
    let tool_backend = HttpToolBackend::new(base_url)?.load_definitions().await?;

    let mut allow_list = StaticAllowList::from_definitions(&tool_backend.definitions());
    allow_list.extend(config.allowed_functions.iter().cloned());

    let model_backend: Arc<dyn ModelBackend> =
        Arc::new(GeminiModelBackend::new(config.gemini_api_key.clone())?);

    let reviewers = config
        .verification_models
        .iter()
        .map(|model| Reviewer {
            model: model.clone(),
            backend: model_backend.clone(),
        })
        .collect();
    let adjudicator = VerificationAdjudicator::new(
        Some(Arc::new(ConsensusVerifier::new(reviewers))),
        Some(config.load_verification_prompt()?),
    );

    info!(
        model = %config.model,
        reviewers = config.verification_models.len(),
        max_turns = config.max_turns,
        "Orchestrator configured"
    );

    Ok(Orchestrator::new(
        model_backend,
        ToolGateway::new(Arc::new(tool_backend), Arc::new(allow_list)),
        adjudicator,
        ContextManager::new(),
    )
    .with_system_prompt(config.load_system_prompt()?)
    .with_max_turns(config.max_turns)
    .with_caching(config.enable_caching)
    .with_audit_log(audit_log))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                OrchestrationError::Config(format!("{} has invalid value '{}'", key, raw))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(config.verification_models.len(), 2);
        assert!(config.enable_caching);
        assert_eq!(config.api_port, DEFAULT_PORT);
    }

    #[test]
    fn test_reads_lists_and_numbers() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("VERIFICATION_MODELS", "a, b ,c"),
            ("ALLOWED_FUNCTIONS", "calculate_rsi,calculate_macd"),
            ("MAX_TURNS", "12"),
            ("API_PORT", "9000"),
            ("ENABLE_PROMPT_CACHING", "false"),
        ]))
        .unwrap();

        assert_eq!(config.verification_models, vec!["a", "b", "c"]);
        assert_eq!(config.allowed_functions, vec!["calculate_rsi", "calculate_macd"]);
        assert_eq!(config.max_turns, 12);
        assert_eq!(config.api_port, 9000);
        assert!(!config.enable_caching);
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("MAX_TURNS", "many")])).unwrap_err();
        assert!(matches!(err, OrchestrationError::Config(_)));
    }

    #[test]
    fn test_builtin_prompts_load() {
        let config = OrchestratorConfig::default();
        assert!(config.load_verification_prompt().is_ok());
        assert!(config.load_system_prompt().unwrap().contains("write_and_validate"));
    }
}
