//! Verification of validated scripts
//!
//! After a script passes write-and-validate, several independent models
//! review it. Only unanimous approval counts as verified. The adjudicator
//! turns the outcome into the next conversation message: an approval that
//! mandates the final response schema, or a rejection listing what to fix.

use crate::classifier::fenced_blocks;
use crate::error::OrchestrationError;
use crate::llm::{ModelBackend, ModelRequest};
use crate::models::{
    Message, ModelVerdict, ToolCall, ToolResult, Verdict, VerificationResult,
    WRITE_AND_VALIDATE_TOOL,
};
use crate::prompts::PromptTemplate;
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const FALLBACK_SCRIPT_NAME: &str = "generated_analysis.py";

//
// ================= Backend Contract =================
//

#[derive(Debug, Clone, Copy)]
pub struct VerificationRequest<'a> {
    pub question: &'a str,
    pub script_content: &'a str,
    /// Fully rendered reviewer prompt
    pub prompt: &'a str,
}

/// Runs several reviewers against a script.
/// `Ok(None)` means no result object could be produced.
#[async_trait]
pub trait VerificationBackend: Send + Sync {
    async fn verify(&self, request: VerificationRequest<'_>) -> Result<Option<VerificationResult>>;
}

//
// ================= Consensus Verifier =================
//

/// One reviewing model
#[derive(Clone)]
pub struct Reviewer {
    pub model: String,
    pub backend: Arc<dyn ModelBackend>,
}

/// Fans a review out to every reviewer concurrently and requires unanimity
pub struct ConsensusVerifier {
    reviewers: Vec<Reviewer>,
}

#[derive(Debug, Deserialize)]
struct ReviewerReply {
    verdict: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    critical_issues: Vec<String>,
}

impl ConsensusVerifier {
    pub fn new(reviewers: Vec<Reviewer>) -> Self {
        Self { reviewers }
    }

    async fn review(reviewer: &Reviewer, prompt: &str) -> ModelVerdict {
        let message = Message::user(prompt);
        let messages = [&message];
        let request = ModelRequest {
            messages: &messages,
            model: &reviewer.model,
            system_prompt: None,
            enable_caching: false,
            tools: &[],
        };

        let outcome = match reviewer.backend.invoke(request).await {
            Ok(response) if response.success => parse_reply(&response.content),
            Ok(response) => Err(response
                .error
                .unwrap_or_else(|| "model call failed".to_string())),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(reply) => ModelVerdict {
                model: reviewer.model.clone(),
                verdict: if reply.verdict.trim().eq_ignore_ascii_case("approve") {
                    Verdict::Approve
                } else {
                    Verdict::Reject
                },
                confidence: reply.confidence,
                issues: reply.issues,
                critical_issues: reply.critical_issues,
                error: None,
            },
            Err(error) => {
                warn!(model = %reviewer.model, %error, "Reviewer failed");
                ModelVerdict {
                    model: reviewer.model.clone(),
                    verdict: Verdict::Reject,
                    confidence: 0.0,
                    issues: Vec::new(),
                    critical_issues: Vec::new(),
                    error: Some(error),
                }
            }
        }
    }
}

#[async_trait]
impl VerificationBackend for ConsensusVerifier {
    async fn verify(&self, request: VerificationRequest<'_>) -> Result<Option<VerificationResult>> {
        if self.reviewers.is_empty() {
            return Ok(None);
        }

        let start = Instant::now();
        let per_model: Vec<ModelVerdict> = join_all(
            self.reviewers
                .iter()
                .map(|reviewer| Self::review(reviewer, request.prompt)),
        )
        .await;

        let verified = per_model
            .iter()
            .all(|v| v.verdict == Verdict::Approve && v.error.is_none());

        Ok(Some(VerificationResult {
            verified,
            per_model,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }))
    }
}

/// Reviewer replies are JSON, fenced or bare, possibly wrapped in prose
fn parse_reply(content: &str) -> std::result::Result<ReviewerReply, String> {
    let fenced = fenced_blocks(content)
        .into_iter()
        .filter(|b| b.tag.eq_ignore_ascii_case("json"))
        .find_map(|b| serde_json::from_str::<ReviewerReply>(b.body.trim()).ok());
    if let Some(reply) = fenced {
        return Ok(reply);
    }

    if let Ok(reply) = serde_json::from_str::<ReviewerReply>(content.trim()) {
        return Ok(reply);
    }

    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if start < end {
            if let Ok(reply) = serde_json::from_str::<ReviewerReply>(&content[start..=end]) {
                return Ok(reply);
            }
        }
    }

    Err("reviewer reply contained no readable verdict".to_string())
}

//
// ================= Adjudicator =================
//

/// Decides whether a tool turn needs verification and builds the follow-up message
pub struct VerificationAdjudicator {
    backend: Option<Arc<dyn VerificationBackend>>,
    prompt: Option<PromptTemplate>,
}

impl VerificationAdjudicator {
    pub fn new(backend: Option<Arc<dyn VerificationBackend>>, prompt: Option<PromptTemplate>) -> Self {
        Self { backend, prompt }
    }

    /// Verification runs only for a successful write-and-validate call
    pub fn should_verify(call: &ToolCall, result: &ToolResult) -> bool {
        call.function_name == WRITE_AND_VALIDATE_TOOL && result.success
    }

    /// Verify the most recent tool exchange if it warrants it.
    ///
    /// Returns `Ok(None)` when no verification applies. A rejection is an
    /// ordinary message; only an unavailable verifier is an error.
    pub async fn maybe_verify(
        &self,
        call: &ToolCall,
        result: &ToolResult,
        question: &str,
        validation_attempts: u32,
    ) -> Result<Option<Message>> {
        if !Self::should_verify(call, result) {
            return Ok(None);
        }

        let Some(script_content) = result.script_content.as_deref() else {
            warn!(tool_call_id = %call.id, "No script content found, skipping verification");
            return Ok(None);
        };

        let prompt = self.prompt.as_ref().ok_or_else(|| {
            OrchestrationError::VerificationUnavailable("no verification prompt configured".into())
        })?;
        let backend = self.backend.as_ref().ok_or_else(|| {
            OrchestrationError::VerificationUnavailable("no verification backend configured".into())
        })?;

        let rendered = prompt.render(&[("question", question), ("script", script_content)]);
        let verification = backend
            .verify(VerificationRequest {
                question,
                script_content,
                prompt: &rendered,
            })
            .await
            .map_err(|e| OrchestrationError::VerificationUnavailable(e.to_string()))?
            .ok_or_else(|| {
                OrchestrationError::VerificationUnavailable(
                    "verification backend returned no result".into(),
                )
            })?;

        let script = SubmittedScript::from_exchange(call, result);

        info!(
            verified = verification.verified,
            reviewers = verification.per_model.len(),
            elapsed_ms = verification.elapsed_ms,
            script_name = %script.name,
            "Verification completed"
        );

        let message = if verification.verified {
            approval_message(&script, &verification, validation_attempts)
        } else {
            rejection_message(&script, &verification)
        };

        Ok(Some(message))
    }
}

/// Script metadata taken from the write-and-validate call
struct SubmittedScript {
    name: String,
    description: String,
    parameters: Value,
}

impl SubmittedScript {
    fn from_exchange(call: &ToolCall, result: &ToolResult) -> Self {
        let string_at = |value: &Value, keys: &[&str]| {
            keys.iter()
                .find_map(|k| value.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };

        let name = string_at(&call.arguments, &["script_name", "filename", "name"])
            .or_else(|| string_at(&result.payload, &["script_name", "filename"]))
            .unwrap_or_else(|| FALLBACK_SCRIPT_NAME.to_string());
        let description = string_at(&call.arguments, &["description", "analysis_description"])
            .unwrap_or_default();
        let parameters = ["parameters", "default_parameters"]
            .iter()
            .find_map(|k| call.arguments.get(*k).cloned())
            .unwrap_or_else(|| json!({}));

        Self {
            name,
            description,
            parameters,
        }
    }
}

fn approval_message(
    script: &SubmittedScript,
    verification: &VerificationResult,
    validation_attempts: u32,
) -> Message {
    let approving = verification.approving_models();
    let description = if script.description.is_empty() {
        "<one-sentence description of what the script computes>"
    } else {
        script.description.as_str()
    };
    let schema = json!({
        "script_generation": {
            "status": "success",
            "script_name": script.name,
            "validation_attempts": validation_attempts,
            "analysis_description": description,
            "verification": {
                "verified": true,
                "approving_models": approving,
                "elapsed_ms": verification.elapsed_ms,
            },
            "execution": {
                "script_name": script.name,
                "parameters": script.parameters,
            }
        }
    });
    let pretty = serde_json::to_string_pretty(&schema).unwrap_or_else(|_| schema.to_string());

    Message::user(format!(
        "VERIFICATION PASSED: all {} reviewing models approved `{}` ({}).\n\n\
         Before we proceed, your next reply MUST contain exactly this structured response \
         in a fenced json code block, and no other structured block:\n\n```json\n{}\n```",
        approving.len(),
        script.name,
        approving.join(", "),
        pretty
    ))
}

fn rejection_message(script: &SubmittedScript, verification: &VerificationResult) -> Message {
    let mut out = format!(
        "VERIFICATION FAILED: `{}` was not approved by every reviewing model.\n\nModel verdicts:\n",
        script.name
    );

    for verdict in &verification.per_model {
        match &verdict.error {
            Some(error) => out.push_str(&format!("- {}: ERROR ({})\n", verdict.model, error)),
            None => {
                out.push_str(&format!(
                    "- {}: {:?} (confidence {:.2})\n",
                    verdict.model, verdict.verdict, verdict.confidence
                ));
                for issue in verdict.issues.iter().chain(verdict.critical_issues.iter()) {
                    out.push_str(&format!("  - {}\n", issue));
                }
            }
        }
    }

    let critical = verification.critical_issues();
    if !critical.is_empty() {
        out.push_str("\nCritical issues to fix:\n");
        for (i, issue) in critical.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, issue));
        }
    }

    out.push_str(&format!(
        "\nFix these issues and resubmit the complete script with the `{}` tool.",
        WRITE_AND_VALIDATE_TOOL
    ));

    Message::user(out)
}
