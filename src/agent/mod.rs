//! Main orchestrator - implements the conversation loop
//!
//! FILTER → MODEL → (TOOLS → VERIFY?)* → CLASSIFY → COMPLETE
//!
//! Runtime failures (model call, tool execution, unclassifiable output) end
//! the loop with a failed `AnalysisResponse`. Exhausted validation attempts
//! and an unusable verifier propagate as hard errors.

use crate::audit::{AuditLog, ConversationRecord};
use crate::classifier::ResponseClassifier;
use crate::error::OrchestrationError;
use crate::execution::ToolGateway;
use crate::llm::{ModelBackend, ModelRequest};
use crate::memory::{ContextManager, ConversationState};
use crate::models::{
    AnalysisResponse, ConversationFailure, FailureKind, Message, ResponseType, StructuredResponse,
    ToolCall, ToolDefinition, WRITE_AND_VALIDATE_TOOL,
};
use crate::verification::VerificationAdjudicator;
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_TURNS: u32 = 40;

/// Main orchestrator that drives one conversation per `run`
pub struct Orchestrator {
    model_backend: Arc<dyn ModelBackend>,
    gateway: ToolGateway,
    adjudicator: VerificationAdjudicator,
    context_manager: ContextManager,
    system_prompt: Option<String>,
    max_turns: u32,
    enable_caching: bool,
    audit_log: Option<Arc<AuditLog>>,
}

impl Orchestrator {
    pub fn new(
        model_backend: Arc<dyn ModelBackend>,
        gateway: ToolGateway,
        adjudicator: VerificationAdjudicator,
        context_manager: ContextManager,
    ) -> Self {
        Self {
            model_backend,
            gateway,
            adjudicator,
            context_manager,
            system_prompt: None,
            max_turns: DEFAULT_MAX_TURNS,
            enable_caching: true,
            audit_log: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_caching(mut self, enable_caching: bool) -> Self {
        self.enable_caching = enable_caching;
        self
    }

    pub fn with_audit_log(mut self, audit_log: Arc<AuditLog>) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    /// Run the conversation loop until a terminal outcome
    pub async fn run(&self, initial_messages: Vec<Message>, model: &str) -> Result<AnalysisResponse> {
        let start_time = Instant::now();
        let conversation_id = Uuid::new_v4();
        let mut state = ConversationState::new(initial_messages);
        let question = state.original_question().unwrap_or_default();

        info!(
            %conversation_id,
            model,
            message_count = state.messages().len(),
            "Orchestrator: starting conversation"
        );

        let response = match self.drive(&mut state, &question, model).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    %conversation_id,
                    error = %e,
                    turns = state.turns(),
                    failed_validations = state.failed_validations(),
                    "Conversation aborted"
                );
                return Err(e);
            }
        };

        info!(
            %conversation_id,
            response_type = %response.response_type,
            success = response.success,
            turns = response.turns,
            tool_calls = response.tool_calls.len(),
            execution_time_ms = start_time.elapsed().as_millis() as u64,
            "Conversation complete"
        );

        if let Some(audit_log) = &self.audit_log {
            let record = ConversationRecord::new(
                question,
                state.messages().to_vec(),
                &response,
                start_time.elapsed().as_millis() as u64,
            );
            audit_log.record(record).await?;
        }

        Ok(response)
    }

    async fn drive(
        &self,
        state: &mut ConversationState,
        question: &str,
        model: &str,
    ) -> Result<AnalysisResponse> {
        let tools: Vec<ToolDefinition> = self.gateway.definitions();

        loop {
            // === FILTER ===
            // The retry threshold is checked before the turn cap so exhausted
            // validation attempts always surface as a hard error.
            let outcome = {
                let filtered = self.context_manager.filter(state.messages())?;

                if state.turns() >= self.max_turns {
                    warn!(max_turns = self.max_turns, "Turn limit reached");
                    return Ok(failure(
                        state,
                        FailureKind::TurnLimitExceeded,
                        format!("conversation exceeded {} turns", self.max_turns),
                        &[],
                    ));
                }

                // === MODEL ===
                debug!(
                    turn = state.turns() + 1,
                    total = state.messages().len(),
                    sent = filtered.len(),
                    "Invoking model"
                );

                self.model_backend
                    .invoke(ModelRequest {
                        messages: &filtered,
                        model,
                        system_prompt: self.system_prompt.as_deref(),
                        enable_caching: self.enable_caching,
                        tools: &tools,
                    })
                    .await
            };
            let turn = state.begin_turn();

            let response = match outcome {
                Ok(response) if response.success => response,
                Ok(response) => {
                    let message = response
                        .error
                        .unwrap_or_else(|| "model call failed".to_string());
                    return soft_failure(state, OrchestrationError::ModelCall(message), &[]);
                }
                Err(e) if e.is_hard() => return Err(e),
                Err(e @ OrchestrationError::ModelCall(_)) => return soft_failure(state, e, &[]),
                Err(e) => {
                    return soft_failure(state, OrchestrationError::ModelCall(e.to_string()), &[]);
                }
            };

            // === CLASSIFY ===
            if response.tool_calls.is_empty() {
                let structured = ResponseClassifier::classify(&response.content);
                debug!(turn, matched = structured.is_match(), "Classified model output");
                state.push_message(Message::assistant(response.content.clone()));
                return Ok(conclude(state, structured, response.content));
            }

            // === TOOLS ===
            let tool_calls = response.tool_calls;
            debug!(
                turn,
                tools = ?tool_calls.iter().map(|c| c.function_name.as_str()).collect::<Vec<_>>(),
                "Model requested tools"
            );

            let results = match self.gateway.execute(&tool_calls).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(turn, error = %e, "Tool execution failed");
                    state.push_message(Message::assistant_with_tool_calls(
                        response.content,
                        tool_calls.clone(),
                    ));
                    return soft_failure(state, e, &tool_calls);
                }
            };

            state.record_tool_turn(
                Message::assistant_with_tool_calls(response.content, tool_calls),
                results,
            );

            // === VERIFY ===
            // The newest write-and-validate exchange of this turn, even when
            // other calls follow it in the same batch.
            let follow_up = match state
                .current_turn()
                .iter()
                .rev()
                .find(|exchange| exchange.call.function_name == WRITE_AND_VALIDATE_TOOL)
            {
                Some(exchange) => {
                    self.adjudicator
                        .maybe_verify(
                            &exchange.call,
                            &exchange.result,
                            question,
                            state.validation_attempts(),
                        )
                        .await?
                }
                None => None,
            };

            if let Some(message) = follow_up {
                state.push_message(message);
            }
        }
    }
}

/// Terminal value for a classified no-tool-call turn
fn conclude(
    state: &ConversationState,
    structured: StructuredResponse,
    final_text: String,
) -> AnalysisResponse {
    let (response_type, failure) = match &structured {
        StructuredResponse::ReuseDecision(_) => (ResponseType::ReuseDecision, None),
        StructuredResponse::ScriptGenerationSuccess(_) => (ResponseType::ScriptGeneration, None),
        StructuredResponse::ScriptGenerationFailed(generation) => (
            ResponseType::ScriptGeneration,
            Some(ConversationFailure {
                kind: FailureKind::ScriptGenerationFailed,
                message: generation
                    .final_error
                    .clone()
                    .unwrap_or_else(|| "script generation failed".to_string()),
            }),
        ),
        StructuredResponse::NoStructuredResponse => (
            ResponseType::Error,
            Some(ConversationFailure {
                kind: FailureKind::NoStructuredResponse,
                message: OrchestrationError::NoStructuredResponse.to_string(),
            }),
        ),
    };

    AnalysisResponse {
        response_type,
        success: failure.is_none(),
        structured,
        failure,
        final_text: Some(final_text),
        tool_calls: state.tool_calls(),
        tool_results: state.tool_results(),
        turns: state.turns(),
        failed_validations: state.failed_validations(),
    }
}

/// Report a soft error as a terminal value; anything else propagates
fn soft_failure(
    state: &ConversationState,
    error: OrchestrationError,
    pending_calls: &[ToolCall],
) -> Result<AnalysisResponse> {
    match error.failure_kind() {
        Some(kind) => Ok(failure(state, kind, error.to_string(), pending_calls)),
        None => Err(error),
    }
}

/// Terminal failure carrying everything accumulated so far
fn failure(
    state: &ConversationState,
    kind: FailureKind,
    message: String,
    pending_calls: &[ToolCall],
) -> AnalysisResponse {
    let mut tool_calls = state.tool_calls();
    tool_calls.extend_from_slice(pending_calls);

    AnalysisResponse {
        response_type: ResponseType::Error,
        success: false,
        structured: StructuredResponse::NoStructuredResponse,
        failure: Some(ConversationFailure { kind, message }),
        final_text: None,
        tool_calls,
        tool_results: state.tool_results(),
        turns: state.turns(),
        failed_validations: state.failed_validations(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelResponse, ScriptedModelBackend};
    use crate::models::{
        ModelVerdict, Role, Verdict, VerificationResult, DOCSTRING_TOOL, WRITE_AND_VALIDATE_TOOL,
    };
    use crate::prompts::PromptTemplate;
    use crate::tools::{StaticAllowList, Tool, ToolRegistry};
    use crate::verification::{VerificationBackend, VerificationRequest};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    const SCRIPT: &str = "import pandas as pd\n\ndef run(symbols, lookback_days=365):\n    return {s: calculate_rsi(s, 14) for s in symbols}\n";

    struct ValidateTool {
        valid: bool,
    }

    #[async_trait]
    impl Tool for ValidateTool {
        fn name(&self) -> &str {
            WRITE_AND_VALIDATE_TOOL
        }

        fn description(&self) -> &str {
            "Write a script and validate it"
        }

        async fn execute(&self, _arguments: &Value) -> crate::Result<Value> {
            if self.valid {
                Ok(json!({ "valid": true }))
            } else {
                Ok(json!({ "valid": false, "error": "NameError: calculate_rsi" }))
            }
        }
    }

    struct DocstringTool;

    #[async_trait]
    impl Tool for DocstringTool {
        fn name(&self) -> &str {
            DOCSTRING_TOOL
        }

        fn description(&self) -> &str {
            "Fetch a function docstring"
        }

        async fn execute(&self, _arguments: &Value) -> crate::Result<Value> {
            Ok(json!({ "success": true, "docstring": "calculate_rsi(close, period=14)" }))
        }
    }

    /// Returns a fixed result and remembers the questions it was asked
    struct FixedVerifier {
        result: Option<VerificationResult>,
        questions: Mutex<Vec<String>>,
    }

    impl FixedVerifier {
        fn new(result: Option<VerificationResult>) -> Self {
            Self {
                result,
                questions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VerificationBackend for FixedVerifier {
        async fn verify(
            &self,
            request: VerificationRequest<'_>,
        ) -> crate::Result<Option<VerificationResult>> {
            self.questions.lock().unwrap().push(request.question.to_string());
            Ok(self.result.clone())
        }
    }

    fn verdict(model: &str, verdict: Verdict) -> ModelVerdict {
        ModelVerdict {
            model: model.into(),
            verdict,
            confidence: 0.9,
            issues: Vec::new(),
            critical_issues: if verdict == Verdict::Reject {
                vec!["look-ahead bias".into()]
            } else {
                Vec::new()
            },
            error: None,
        }
    }

    fn verified(approved: bool) -> VerificationResult {
        VerificationResult {
            verified: approved,
            per_model: vec![
                verdict("gemini-2.0-flash", Verdict::Approve),
                verdict(
                    "gemini-1.5-pro",
                    if approved { Verdict::Approve } else { Verdict::Reject },
                ),
            ],
            elapsed_ms: 840,
        }
    }

    fn write_call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            function_name: WRITE_AND_VALIDATE_TOOL.into(),
            arguments: json!({
                "script_name": "rsi_scan.py",
                "description": "RSI(14) for each symbol",
                "parameters": { "symbols": ["AAPL"] },
                "content": SCRIPT
            }),
        }
    }

    fn docstring_call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            function_name: DOCSTRING_TOOL.into(),
            arguments: json!({ "function_name": "calculate_rsi" }),
        }
    }

    fn orchestrator(
        model: Arc<ScriptedModelBackend>,
        valid: bool,
        verifier: Option<Arc<FixedVerifier>>,
    ) -> Orchestrator {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ValidateTool { valid }));
        registry.register(Arc::new(DocstringTool));

        let gateway = ToolGateway::new(
            Arc::new(registry),
            Arc::new(StaticAllowList::new(["calculate_rsi"])),
        );
        let adjudicator = VerificationAdjudicator::new(
            verifier.map(|v| v as Arc<dyn VerificationBackend>),
            Some(PromptTemplate::default_verification()),
        );

        Orchestrator::new(model, gateway, adjudicator, ContextManager::new())
    }

    fn question() -> Vec<Message> {
        vec![Message::user("Which of my symbols have RSI below 30?")]
    }

    #[tokio::test]
    async fn test_plain_text_without_structure_fails() {
        let model = Arc::new(ScriptedModelBackend::new(vec![ModelResponse::text("no")]));
        let orchestrator = orchestrator(model, true, None);

        let response = assert_ok!(orchestrator.run(question(), "test-model").await);

        assert!(!response.success);
        assert_eq!(response.response_type, ResponseType::Error);
        assert_eq!(
            response.failure.unwrap().kind,
            FailureKind::NoStructuredResponse
        );
        assert_eq!(response.final_text.as_deref(), Some("no"));
        assert_eq!(response.turns, 1);
    }

    #[tokio::test]
    async fn test_validated_script_is_verified_then_accepted() {
        let final_reply = r#"```json
{"script_generation": {"status": "success", "script_name": "rsi_scan.py", "validation_attempts": 1}}
```"#;
        let model = Arc::new(ScriptedModelBackend::new(vec![
            ModelResponse::with_tool_calls("", vec![write_call("w1")]),
            ModelResponse::text(final_reply),
        ]));
        let verifier = Arc::new(FixedVerifier::new(Some(verified(true))));
        let orchestrator = orchestrator(model.clone(), true, Some(verifier.clone()))
            .with_system_prompt("system");

        let response = assert_ok!(orchestrator.run(question(), "test-model").await);

        assert!(response.success);
        assert_eq!(response.response_type, ResponseType::ScriptGeneration);
        match &response.structured {
            StructuredResponse::ScriptGenerationSuccess(generation) => {
                assert_eq!(generation.script_name.as_deref(), Some("rsi_scan.py"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(response.tool_calls.len(), 1);
        assert!(response.tool_results[0].success);

        assert_eq!(
            *verifier.questions.lock().unwrap(),
            vec!["Which of my symbols have RSI below 30?".to_string()]
        );

        // Second turn sees the validation pair followed by the approval notice
        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].system_prompt.as_deref(), Some("system"));
        let second = &requests[1].messages;
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].role, Role::ToolResult);
        assert!(second[3].text().starts_with("VERIFICATION PASSED"));
        assert!(second[3].text().contains("gemini-1.5-pro"));
    }

    #[tokio::test]
    async fn test_repeated_validation_failures_abort() {
        let model = Arc::new(ScriptedModelBackend::new(
            (1..=5)
                .map(|i| ModelResponse::with_tool_calls("", vec![write_call(&format!("w{}", i))]))
                .collect(),
        ));
        let verifier = Arc::new(FixedVerifier::new(Some(verified(true))));
        let orchestrator = orchestrator(model.clone(), false, Some(verifier.clone()));

        let err = assert_err!(orchestrator.run(question(), "test-model").await);

        assert!(matches!(err, OrchestrationError::MaxRetriesExceeded { attempts: 4 }));
        assert!(err.is_hard());
        assert_eq!(model.requests().len(), 4);
        assert!(verifier.questions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_limit_wins_over_turn_limit() {
        let model = Arc::new(ScriptedModelBackend::new(
            (1..=4)
                .map(|i| ModelResponse::with_tool_calls("", vec![write_call(&format!("w{}", i))]))
                .collect(),
        ));
        let orchestrator = orchestrator(model.clone(), false, None).with_max_turns(4);

        let err = assert_err!(orchestrator.run(question(), "test-model").await);

        assert!(matches!(err, OrchestrationError::MaxRetriesExceeded { attempts: 4 }));
        assert_eq!(model.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_validation_followed_by_docstring_is_still_verified() {
        let final_reply = r#"```json
{"script_generation": {"status": "success", "script_name": "rsi_scan.py"}}
```"#;
        let model = Arc::new(ScriptedModelBackend::new(vec![
            ModelResponse::with_tool_calls("", vec![write_call("w1"), docstring_call("d1")]),
            ModelResponse::text(final_reply),
        ]));
        let verifier = Arc::new(FixedVerifier::new(Some(verified(true))));
        let orchestrator = orchestrator(model.clone(), true, Some(verifier.clone()));

        let response = assert_ok!(orchestrator.run(question(), "test-model").await);

        assert!(response.success);
        assert_eq!(verifier.questions.lock().unwrap().len(), 1);
        let second = &model.requests()[1].messages;
        assert!(second.last().unwrap().text().starts_with("VERIFICATION PASSED"));
    }

    #[tokio::test]
    async fn test_rejection_continues_loop() {
        let failed_reply = r#"```json
{"script_generation": {"status": "failed", "final_error": "could not remove look-ahead bias"}}
```"#;
        let model = Arc::new(ScriptedModelBackend::new(vec![
            ModelResponse::with_tool_calls("", vec![write_call("w1")]),
            ModelResponse::text(failed_reply),
        ]));
        let verifier = Arc::new(FixedVerifier::new(Some(verified(false))));
        let orchestrator = orchestrator(model.clone(), true, Some(verifier));

        let response = assert_ok!(orchestrator.run(question(), "test-model").await);

        assert!(!response.success);
        assert_eq!(response.response_type, ResponseType::ScriptGeneration);
        let failure = response.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ScriptGenerationFailed);
        assert_eq!(failure.message, "could not remove look-ahead bias");

        let second = &model.requests()[1].messages;
        let notice = second.last().unwrap().text();
        assert!(notice.starts_with("VERIFICATION FAILED"));
        assert!(notice.contains("1. look-ahead bias"));
    }

    #[tokio::test]
    async fn test_reuse_decision_after_docstring_lookup() {
        let reuse = r#"```json
{"reuse_decision": {"should_reuse": true, "existing_function_name": "rsi_oversold_scan"}}
```"#;
        let model = Arc::new(ScriptedModelBackend::new(vec![
            ModelResponse::with_tool_calls("Checking docs.", vec![docstring_call("d1")]),
            ModelResponse::text(reuse),
        ]));
        let orchestrator = orchestrator(model.clone(), true, None);

        let response = assert_ok!(orchestrator.run(question(), "test-model").await);

        assert!(response.success);
        assert_eq!(response.response_type, ResponseType::ReuseDecision);
        assert_eq!(response.turns, 2);
        assert_eq!(response.tool_results[0].function_name, DOCSTRING_TOOL);
        assert_eq!(
            model.requests()[0].tool_names,
            vec![DOCSTRING_TOOL.to_string(), WRITE_AND_VALIDATE_TOOL.to_string()]
        );
    }

    #[tokio::test]
    async fn test_model_failure_is_soft() {
        let model = Arc::new(ScriptedModelBackend::new(vec![ModelResponse::failure(
            "quota exhausted",
        )]));
        let orchestrator = orchestrator(model, true, None);

        let response = assert_ok!(orchestrator.run(question(), "test-model").await);

        let failure = response.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ModelCall);
        assert_eq!(failure.message, "Model call failed: quota exhausted");
        assert_eq!(response.response_type, ResponseType::Error);
    }

    #[tokio::test]
    async fn test_disallowed_tool_is_soft_failure_with_diagnostics() {
        let forbidden = ToolCall {
            id: "x1".into(),
            function_name: "os_system".into(),
            arguments: json!({ "cmd": "ls" }),
        };
        let model = Arc::new(ScriptedModelBackend::new(vec![
            ModelResponse::with_tool_calls("", vec![docstring_call("d1")]),
            ModelResponse::with_tool_calls("", vec![forbidden]),
        ]));
        let orchestrator = orchestrator(model, true, None);

        let response = assert_ok!(orchestrator.run(question(), "test-model").await);

        let failure = response.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ToolExecution);
        assert!(failure.message.contains("os_system"));
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_results.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_verifier_is_hard_error() {
        let model = Arc::new(ScriptedModelBackend::new(vec![ModelResponse::with_tool_calls(
            "",
            vec![write_call("w1")],
        )]));
        let orchestrator = orchestrator(model, true, None);

        let err = assert_err!(orchestrator.run(question(), "test-model").await);
        assert!(matches!(err, OrchestrationError::VerificationUnavailable(_)));
    }

    #[tokio::test]
    async fn test_turn_limit() {
        let model = Arc::new(ScriptedModelBackend::new(
            (1..=3)
                .map(|i| ModelResponse::with_tool_calls("", vec![docstring_call(&format!("d{}", i))]))
                .collect(),
        ));
        let orchestrator = orchestrator(model, true, None).with_max_turns(2);

        let response = assert_ok!(orchestrator.run(question(), "test-model").await);

        assert_eq!(response.failure.unwrap().kind, FailureKind::TurnLimitExceeded);
        assert_eq!(response.turns, 2);
        assert_eq!(response.tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_conversation_is_audited() {
        let audit_log = Arc::new(AuditLog::new());
        let model = Arc::new(ScriptedModelBackend::new(vec![ModelResponse::text("no")]));
        let orchestrator = orchestrator(model, true, None).with_audit_log(audit_log.clone());

        assert_ok!(orchestrator.run(question(), "test-model").await);

        let ids = audit_log.list().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(audit_log.verify_integrity(ids[0]).await.unwrap());
        let record = audit_log.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(record.transcript.len(), 2);
        assert_eq!(record.response_type, ResponseType::Error);
    }
}
